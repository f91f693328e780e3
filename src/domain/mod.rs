// Domain-specific error types
pub mod errors;

// Capability interfaces (ports)
pub mod ports;

// Core entity and value types
pub mod types;
