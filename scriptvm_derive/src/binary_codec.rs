//! Derive macro for the module-image binary format.
//!
//! Generates `Encode` and `Decode` implementations for structs and enums
//! against `crate::types::encoding`.
//!
//! # Binary Format
//!
//! - Struct fields are written in declaration order, with no framing
//! - Enums write a `u8` discriminant (explicit `= N` values are honoured)
//!   followed by the variant's fields
//!
//! Unions are rejected at compile time.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DataEnum, DeriveInput, Fields, parse_macro_input};

/// Derives `Encode` and `Decode` for a type.
///
/// ```ignore
/// use scriptvm_derive::BinaryCodec;
///
/// #[derive(BinaryCodec)]
/// pub struct LineEntry {
///     pub offset: u32,
///     pub line: u32,
/// }
/// ```
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => struct_bodies(&data.fields),
        Data::Enum(data) => enum_bodies(data)?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "BinaryCodec derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    })
}

/// Bodies for named, tuple and unit structs.
fn struct_bodies(fields: &Fields) -> (TokenStream2, TokenStream2) {
    match fields {
        Fields::Named(named) => {
            let names: Vec<_> = named.named.iter().map(|f| &f.ident).collect();
            (
                quote! { #( crate::types::encoding::Encode::encode(&self.#names, out); )* },
                quote! {
                    Ok(Self { #( #names: crate::types::encoding::Decode::decode(input)?, )* })
                },
            )
        }
        Fields::Unnamed(unnamed) => {
            let indices: Vec<_> = (0..unnamed.unnamed.len()).map(syn::Index::from).collect();
            let decodes = indices
                .iter()
                .map(|_| quote! { crate::types::encoding::Decode::decode(input)?, });
            (
                quote! { #( crate::types::encoding::Encode::encode(&self.#indices, out); )* },
                quote! { Ok(Self( #(#decodes)* )) },
            )
        }
        Fields::Unit => (quote! {}, quote! { Ok(Self) }),
    }
}

/// Bodies for enums: a `u8` tag, then the variant's fields in order.
fn enum_bodies(data: &DataEnum) -> syn::Result<(TokenStream2, TokenStream2)> {
    let tags = discriminants(data)?;
    let mut encode_arms = Vec::with_capacity(tags.len());
    let mut decode_arms = Vec::with_capacity(tags.len());

    for (variant, tag) in data.variants.iter().zip(tags) {
        let ident = &variant.ident;
        match &variant.fields {
            Fields::Unit => {
                encode_arms.push(quote! {
                    Self::#ident => crate::types::encoding::Encode::encode(&#tag, out),
                });
                decode_arms.push(quote! { #tag => Ok(Self::#ident), });
            }
            Fields::Unnamed(unnamed) => {
                let binds: Vec<_> = (0..unnamed.unnamed.len())
                    .map(|i| format_ident!("f{}", i))
                    .collect();
                let decodes = binds
                    .iter()
                    .map(|_| quote! { crate::types::encoding::Decode::decode(input)?, });
                encode_arms.push(quote! {
                    Self::#ident( #(#binds),* ) => {
                        crate::types::encoding::Encode::encode(&#tag, out);
                        #( crate::types::encoding::Encode::encode(#binds, out); )*
                    }
                });
                decode_arms.push(quote! { #tag => Ok(Self::#ident( #(#decodes)* )), });
            }
            Fields::Named(named) => {
                let binds: Vec<_> = named.named.iter().map(|f| &f.ident).collect();
                encode_arms.push(quote! {
                    Self::#ident { #(#binds),* } => {
                        crate::types::encoding::Encode::encode(&#tag, out);
                        #( crate::types::encoding::Encode::encode(#binds, out); )*
                    }
                });
                decode_arms.push(quote! {
                    #tag => Ok(Self::#ident {
                        #( #binds: crate::types::encoding::Decode::decode(input)?, )*
                    }),
                });
            }
        }
    }

    Ok((
        quote! {
            match self {
                #(#encode_arms)*
            }
        },
        quote! {
            let tag: u8 = crate::types::encoding::Decode::decode(input)?;
            match tag {
                #(#decode_arms)*
                _ => Err(crate::types::encoding::DecodeError::InvalidValue),
            }
        },
    ))
}

/// Computes each variant's tag: explicit `= N` literals win, others count up
/// from the previous tag. Tags must fit in a `u8`.
fn discriminants(data: &DataEnum) -> syn::Result<Vec<u8>> {
    let mut tags = Vec::with_capacity(data.variants.len());
    let mut next: u16 = 0;

    for variant in &data.variants {
        let tag = match &variant.discriminant {
            Some((_, syn::Expr::Lit(syn::ExprLit {
                lit: syn::Lit::Int(lit),
                ..
            }))) => lit.base10_parse::<u8>()? as u16,
            Some((_, expr)) => {
                return Err(syn::Error::new_spanned(
                    expr,
                    "BinaryCodec discriminants must be integer literals",
                ));
            }
            None => next,
        };
        let tag = u8::try_from(tag).map_err(|_| {
            syn::Error::new_spanned(variant, "BinaryCodec supports at most 256 variants")
        })?;
        tags.push(tag);
        next = tag as u16 + 1;
    }

    Ok(tags)
}
