//! Integration tests that drive `chatline-core` through its public API.

#[cfg(test)]
mod unit;
