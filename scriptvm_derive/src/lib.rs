//! Derive macros for the `scriptvm` crate.
//!
//! Provides:
//! - `#[derive(BinaryCodec)]` - binary encoding for module images and constant pools
//! - `#[derive(Error)]` - `Display` + `std::error::Error` from `#[error("...")]` messages

mod binary_codec;
mod error;

use proc_macro::TokenStream;

/// Implements `Encode` and `Decode` from `scriptvm::types::encoding`.
#[proc_macro_derive(BinaryCodec)]
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    binary_codec::derive_binary_codec(input)
}

/// Implements `Display` and `Error` for error types.
#[proc_macro_derive(Error, attributes(error))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}
