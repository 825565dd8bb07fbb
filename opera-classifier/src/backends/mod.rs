// ABOUTME: Classifier backend implementations.
// ABOUTME: The mock backend ships here; network backends live with the service binary.

pub mod mock;
