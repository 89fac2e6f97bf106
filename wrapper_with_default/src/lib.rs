//! Derive macro for newtype wrappers that carry a compile-time default.
//!
//! Configuration types frequently wrap a single inner value (a `Duration`, a
//! `usize`, a `bool`) whose default is a named constant. Deriving
//! `WrapperWithDefault` generates the `Default` implementation plus the
//! `From` conversions in both directions, so the wrapper can be used
//! transparently wherever the inner type is expected.
//!
//! ```ignore
//! const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
//!
//! #[derive(WrapperWithDefault)]
//! #[wrapper_default_value(DEFAULT_INTERVAL)]
//! struct Interval(Duration);
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Expr, Fields};

#[proc_macro_derive(WrapperWithDefault, attributes(wrapper_default_value))]
pub fn wrapper_with_default(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    let default_value: Expr = input
        .attrs
        .iter()
        .find(|attr| attr.path().is_ident("wrapper_default_value"))
        .ok_or_else(|| {
            syn::Error::new_spanned(
                &input.ident,
                "missing #[wrapper_default_value(...)] attribute",
            )
        })?
        .parse_args()?;

    let inner_type = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
                fields.unnamed.first().map(|field| field.ty.clone())
            }
            _ => None,
        },
        _ => None,
    }
    .ok_or_else(|| {
        syn::Error::new_spanned(
            &input.ident,
            "WrapperWithDefault requires a tuple struct with exactly one field",
        )
    })?;

    Ok(quote! {
        impl ::core::default::Default for #name {
            fn default() -> Self {
                Self(#default_value)
            }
        }

        impl ::core::convert::From<#inner_type> for #name {
            fn from(value: #inner_type) -> Self {
                Self(value)
            }
        }

        impl ::core::convert::From<#name> for #inner_type {
            fn from(wrapper: #name) -> Self {
                wrapper.0
            }
        }
    })
}
