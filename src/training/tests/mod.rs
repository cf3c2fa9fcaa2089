//! Test suite for the training loop and checkpointing
//!
//! Unit tests live next to each component; these modules exercise the
//! trainer end to end against the reference model and in-memory data.

pub mod checkpoint_tests;

// Utility modules for testing
pub mod test_utils;

pub use test_utils::{
    assert_tensor_close, create_labeled_batch, create_test_config, create_test_device, create_test_model,
    create_test_trainer,
};
