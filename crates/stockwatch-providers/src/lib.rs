//! # StockWatch Providers
//!
//! Clients for the external availability calculation.
//! Only an HTTP/JSON client exists today; anything implementing
//! `stockwatch_core::Calculator` can be plugged into the executor instead.

pub mod http_calculator;

pub use http_calculator::HttpCalculator;
