// ABOUTME: Extension to MIME type table for generated resources.
// ABOUTME: Unknown or missing extensions map to text/plain.

pub const DEFAULT_MIME: &str = "text/plain";

const MIME_TABLE: &[(&str, &[&str])] = &[
    ("text/plain", &["txt", "log", "ini", "conf"]),
    ("text/x-python", &["py"]),
    ("text/javascript", &["js"]),
    ("text/html", &["html", "htm"]),
    ("text/css", &["css"]),
    ("application/json", &["json"]),
    ("application/xml", &["xml"]),
    ("text/markdown", &["md"]),
    ("text/x-yaml", &["yml", "yaml"]),
];

/// MIME type for a file path based on its extension
pub fn mime_for_path(path: &str) -> &'static str {
    let file_name = path.rsplit(&['/', '\\'][..]).next().unwrap_or(path);
    let Some((_, ext)) = file_name.rsplit_once('.') else {
        return DEFAULT_MIME;
    };
    let ext = ext.to_ascii_lowercase();
    MIME_TABLE
        .iter()
        .find(|(_, exts)| exts.contains(&ext.as_str()))
        .map(|(mime, _)| *mime)
        .unwrap_or(DEFAULT_MIME)
}

pub fn is_html(path: &str) -> bool {
    mime_for_path(path) == "text/html"
}
