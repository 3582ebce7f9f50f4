//! Shared test fixtures.

pub mod mock_billing;
pub mod mock_channel;
