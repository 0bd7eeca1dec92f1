// Export all types from this module
pub mod batch;
pub mod message;

// Re-export all types for convenience
pub use batch::*;
pub use message::*;
