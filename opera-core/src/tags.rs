// ABOUTME: Helpers for the free-form dialogue tag string, which may embed JSON fragments.
// ABOUTME: Extracts version ids and viewer resource references from those fragments.

use opera_classifier::ResourceRef;
use serde_json::Value;

/// Case-insensitive substring match
pub fn contains_tag(tags: &str, needle: &str) -> bool {
    tags.to_lowercase().contains(&needle.to_lowercase())
}

/// Split a `[a, b, c]` or `a,b,c` tag string into trimmed, non-empty items
pub fn split_tags(tags: &str) -> Vec<String> {
    tags.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|t| t.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Byte index of the `}` closing the object opened at `start`, if it closes
fn closing_brace(tags: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in tags[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Every `{...}` fragment in the tags that parses as a JSON object, in order.
///
/// A fragment that never closes or fails to parse is skipped, and scanning
/// resumes at the next `{` after its opening brace.
pub fn json_fragments(tags: &str) -> Vec<Value> {
    let mut fragments = Vec::new();
    let mut pos = 0;

    while let Some(found) = tags[pos..].find('{') {
        let start = pos + found;
        let parsed = closing_brace(tags, start).and_then(|end| {
            match serde_json::from_str::<Value>(&tags[start..=end]) {
                Ok(value) if value.is_object() => Some((value, end)),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed tag fragment");
                    None
                }
            }
        });
        match parsed {
            Some((value, end)) => {
                fragments.push(value);
                pos = end + 1;
            }
            None => pos = start + 1,
        }
    }
    fragments
}

fn version_in_fragment(fragment: &Value) -> Option<String> {
    let selected = fragment
        .get("SelectedTextsFromViewer")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .find_map(|item| item.get("VersionId").and_then(Value::as_str))
        });
    if let Some(id) = selected {
        return Some(id.to_string());
    }

    ["ResourcesForViewing", "ResourcesForIncarnating"]
        .iter()
        .find_map(|key| {
            fragment
                .get(*key)
                .and_then(|v| v.get("VersionId"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
}

/// First version id found across the tag's JSON fragments
pub fn parse_version_id(tags: &str) -> Option<String> {
    json_fragments(tags).iter().find_map(version_in_fragment)
}

fn viewing_resources(fragment: &Value) -> Vec<ResourceRef> {
    let mut found = Vec::new();
    for key in ["ResourcesForViewing", "ResourcesForIncarnating"] {
        let Some(section) = fragment.get(key) else {
            continue;
        };
        if let Some(resources) = section.get("Resources").and_then(Value::as_array) {
            found.extend(resources.iter().filter_map(|r| {
                Some(ResourceRef {
                    file_path: r.get("Url")?.as_str()?.to_string(),
                    resource_id: r.get("ResourceId")?.as_str()?.to_string(),
                })
            }));
        } else if let Some(version) = section.get("CurrentVersion") {
            let files = version
                .get("current_files")
                .or_else(|| version.get("modified_files"))
                .and_then(Value::as_array);
            if let Some(files) = files {
                found.extend(
                    files
                        .iter()
                        .filter_map(|f| serde_json::from_value::<ResourceRef>(f.clone()).ok()),
                );
            }
        }
    }
    found
}

fn mentioned_resources(fragment: &Value) -> Vec<ResourceRef> {
    let Some(mentioned) = fragment.get("ResourcesMentionedFromViewer") else {
        return Vec::new();
    };
    let ids: Vec<&Value> = match mentioned {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => Vec::new(),
    };
    ids.into_iter()
        .filter_map(|v| match v {
            Value::String(id) => Some(id.clone()),
            other => other
                .get("ResourceId")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
        .map(|resource_id| ResourceRef {
            file_path: String::new(),
            resource_id,
        })
        .collect()
}

/// Resources a viewer attached to the tags directly.
///
/// Explicit resource lists win over bare mentioned ids. An empty result means
/// the caller should fall back to resolving [`parse_version_id`] itself.
pub fn extract_iteration_resources(tags: &str) -> Vec<ResourceRef> {
    let fragments = json_fragments(tags);
    let viewing: Vec<ResourceRef> = fragments.iter().flat_map(viewing_resources).collect();
    if !viewing.is_empty() {
        return viewing;
    }
    fragments.iter().flat_map(mentioned_resources).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_tag_case_insensitive() {
        assert!(contains_tag("foo,TASK_CALLBACK", "task_callback"));
        assert!(!contains_tag("", "code"));
    }

    #[test]
    fn test_split_tags() {
        assert_eq!(split_tags("[a, b ,c]"), vec!["a", "b", "c"]);
        assert_eq!(split_tags("single"), vec!["single"]);
        assert!(split_tags("  ").is_empty());
    }

    #[test]
    fn test_version_from_selected_texts() {
        let tags = r#"{"SelectedTextsFromViewer": [{"Text": "x"}, {"VersionId": "v-2"}]}"#;
        assert_eq!(parse_version_id(tags), Some("v-2".to_string()));
    }

    #[test]
    fn test_version_priority_within_fragment() {
        let tags = r#"{"ResourcesForIncarnating": {"VersionId": "inc"},
                       "ResourcesForViewing": {"VersionId": "view"}}"#;
        assert_eq!(parse_version_id(tags), Some("view".to_string()));
    }

    #[test]
    fn test_malformed_fragment_skipped() {
        let tags = r#"code_request {"broken": } then {"ResourcesForViewing": {"VersionId": "ok"}}"#;
        assert_eq!(parse_version_id(tags), Some("ok".to_string()));
    }

    #[test]
    fn test_braces_inside_strings() {
        let tags = r#"{"note": "a } brace", "ResourcesForViewing": {"VersionId": "v"}}"#;
        assert_eq!(parse_version_id(tags), Some("v".to_string()));
    }

    #[test]
    fn test_no_version() {
        assert_eq!(parse_version_id("code_request,framework_vue"), None);
        assert_eq!(parse_version_id(r#"{"SelectedTextsFromViewer": []}"#), None);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let tags = r#"{"ResourcesForViewing": {"VersionId": "same"}} {"ResourcesForViewing": {"VersionId": "other"}}"#;
        let first = parse_version_id(tags);
        for _ in 0..5 {
            assert_eq!(parse_version_id(tags), first);
        }
        assert_eq!(first, Some("same".to_string()));
    }

    #[test]
    fn test_extract_viewing_resources() {
        let tags = r#"{"ResourcesForViewing": {"VersionId": "v", "Resources": [
            {"Url": "/src/index.html", "ResourceId": "r1"},
            {"Url": "/src/app.js"}
        ]}}"#;
        let found = extract_iteration_resources(tags);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_path, "/src/index.html");
        assert_eq!(found[0].resource_id, "r1");
    }

    #[test]
    fn test_extract_current_version_files() {
        let tags = r#"{"ResourcesForViewing": {"CurrentVersion": {"current_files": [
            {"file_path": "a.py", "resource_id": "1"}
        ]}}}"#;
        let found = extract_iteration_resources(tags);
        assert_eq!(found[0].file_path, "a.py");
    }

    #[test]
    fn test_extract_mentioned_ids() {
        let tags = r#"{"ResourcesMentionedFromViewer": ["id-1", "id-2"]}"#;
        let found = extract_iteration_resources(tags);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|r| r.file_path.is_empty()));
        assert_eq!(found[1].resource_id, "id-2");
    }

    #[test]
    fn test_selected_texts_need_resolution() {
        let tags = r#"{"SelectedTextsFromViewer": [{"VersionId": "v1"}]}"#;
        assert!(extract_iteration_resources(tags).is_empty());
    }

    #[test]
    fn test_unclosed_fragment_does_not_hide_later_ones() {
        let tags = r#"note {"oops" then {"ResourcesForViewing":{"VersionId":"ok"}}"#;
        assert_eq!(parse_version_id(tags).as_deref(), Some("ok"));
    }

    #[test]
    fn test_unparseable_fragment_is_skipped() {
        let tags = r#"{bad json} {"ResourcesForIncarnating": {"VersionId": "v-9"}}"#;
        assert_eq!(json_fragments(tags).len(), 1);
        assert_eq!(parse_version_id(tags).as_deref(), Some("v-9"));
    }
}
