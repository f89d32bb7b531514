/// Key derivation and digest signing
pub mod crypto_utils;
/// In-process transport
pub mod loopback;
/// Test fixtures
#[cfg(any(test, feature = "test_utils"))]
#[allow(missing_docs)]
pub mod test_utils;
