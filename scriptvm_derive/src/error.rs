//! Derive macro for error types.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations,
//! in the spirit of `thiserror` but limited to what the VM needs.
//!
//! ```ignore
//! use scriptvm_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum VMError {
//!     #[error("invalid opcode 0x{0:02x}")]
//!     InvalidOpcode(u8),
//!
//!     #[error("int register {index} out of range ({available} declared)")]
//!     RegisterOutOfRange { index: u8, available: usize, bank: &'static str },
//!
//!     #[error("staging area overflow")]
//!     StagingOverflow,
//! }
//! ```
//!
//! Fields are interpolated with `{0}` (tuple) or `{name}` (named); format specs
//! such as `{0:02x}` are accepted. Fields the message never mentions are
//! simply not formatted.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, format_ident, quote};
use syn::{Data, DeriveInput, Fields, Lit, Meta, parse_macro_input};

/// Derives `Display` and `Error` for an enum or struct.
pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand_error_derive(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_error_derive(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = match &input.data {
        Data::Enum(data_enum) => {
            let arms = data_enum
                .variants
                .iter()
                .map(|variant| {
                    let message = message_from_attrs(
                        &variant.attrs,
                        &variant.ident,
                        &format!("variant `{}`", variant.ident),
                    )?;
                    let ident = &variant.ident;
                    Ok(match &variant.fields {
                        Fields::Unit => quote! { Self::#ident => write!(f, #message), },
                        Fields::Unnamed(fields) => {
                            let (message, used) =
                                positional_to_named(&message, fields.unnamed.len());
                            let pattern = (0..fields.unnamed.len()).map(|i| {
                                if used.contains(&i) {
                                    format_ident!("f{}", i).into_token_stream()
                                } else {
                                    quote! { _ }
                                }
                            });
                            let args = used.iter().map(|i| {
                                let id = format_ident!("f{}", i);
                                quote! { #id = #id }
                            });
                            quote! {
                                Self::#ident( #(#pattern),* ) => write!(f, #message #(, #args)*),
                            }
                        }
                        Fields::Named(fields) => {
                            let used: Vec<_> = fields
                                .named
                                .iter()
                                .filter_map(|field| field.ident.as_ref())
                                .filter(|id| mentions(&message, &id.to_string()))
                                .collect();
                            quote! {
                                Self::#ident { #(#used,)* .. } => write!(f, #message #(, #used = #used)*),
                            }
                        }
                    })
                })
                .collect::<syn::Result<Vec<_>>>()?;

            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Struct(data_struct) => {
            let message =
                message_from_attrs(&input.attrs, &input.ident, &format!("type `{}`", name))?;
            match &data_struct.fields {
                Fields::Unit => quote! { write!(f, #message) },
                Fields::Named(fields) => {
                    let used: Vec<_> = fields
                        .named
                        .iter()
                        .filter_map(|field| field.ident.as_ref())
                        .filter(|id| mentions(&message, &id.to_string()))
                        .collect();
                    quote! { write!(f, #message #(, #used = self.#used)*) }
                }
                Fields::Unnamed(fields) => {
                    let (message, used) = positional_to_named(&message, fields.unnamed.len());
                    let args = used.iter().map(|i| {
                        let id = format_ident!("f{}", i);
                        let index = syn::Index::from(*i);
                        quote! { #id = self.#index }
                    });
                    quote! { write!(f, #message #(, #args)*) }
                }
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Reads the string literal out of `#[error("...")]`.
fn message_from_attrs<T: ToTokens>(
    attrs: &[syn::Attribute],
    target: &T,
    target_desc: &str,
) -> syn::Result<String> {
    let Some(attr) = attrs.iter().find(|a| a.path().is_ident("error")) else {
        return Err(syn::Error::new_spanned(
            target,
            format!("missing #[error(\"...\")] attribute on {target_desc}"),
        ));
    };

    let Meta::List(list) = &attr.meta else {
        return Err(syn::Error::new_spanned(
            &attr.meta,
            "expected #[error(\"message\")]",
        ));
    };

    match syn::parse2::<Lit>(list.tokens.clone()) {
        Ok(Lit::Str(lit)) => Ok(lit.value()),
        _ => Err(syn::Error::new_spanned(
            &attr.meta,
            "#[error] message must be a single string literal",
        )),
    }
}

/// True when `message` has a `{name}` or `{name:spec}` placeholder.
fn mentions(message: &str, name: &str) -> bool {
    message
        .match_indices('{')
        .filter(|(at, _)| !message[..*at].ends_with('{'))
        .any(|(at, _)| {
            let rest = &message[at + 1..];
            rest.strip_prefix(name)
                .is_some_and(|tail| tail.starts_with('}') || tail.starts_with(':'))
        })
}

/// Rewrites `{0}` / `{0:x}` into `{f0}` / `{f0:x}` and reports which indices appear.
fn positional_to_named(message: &str, field_count: usize) -> (String, Vec<usize>) {
    let mut result = message.to_string();
    let mut used = Vec::new();
    for i in (0..field_count).rev() {
        let plain = format!("{{{i}}}");
        let spec = format!("{{{i}:");
        if result.contains(&plain) || result.contains(&spec) {
            result = result
                .replace(&plain, &format!("{{f{i}}}"))
                .replace(&spec, &format!("{{f{i}:"));
            used.push(i);
        }
    }
    used.reverse();
    (result, used)
}
