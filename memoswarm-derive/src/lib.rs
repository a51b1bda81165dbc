//! The `#[pure_function]` attribute.
//!
//! Placed on an `impl PureFunction for T` block, it:
//! - fills in `NAME` (the type name in snake case) unless the block defines
//!   it, or `#[pure_function(name = "...")]` overrides it;
//! - fills in `SOURCE` from the block's tokens, with doc comments removed, so
//!   that formatting and comments never change a function's version;
//! - rejects blocks that touch ambient state (see [`isolation`]);
//! - registers a constructor for `T` in a [`linkme`](https://docs.rs/linkme)
//!   distributed slice, gathered by the linker into a single section of the
//!   binary, so that every compute node built from the same code can find
//!   the function without any registration call.
//!
//! `T` must implement `Default`.
extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{format_ident, quote, ToTokens};
use syn::{parse_macro_input, Error, ImplItem, ItemImpl, LitStr, Result, Type};

mod isolation;

#[derive(Default)]
struct Options {
    is_internal: bool,
    name: Option<LitStr>,
}

/// See the [module level documentation](crate) for more information.
#[proc_macro_attribute]
pub fn pure_function(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut options = Options::default();
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("internal") {
            options.is_internal = true;
            Ok(())
        } else if meta.path.is_ident("name") {
            options.name = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("unsupported pure_function attribute"))
        }
    });
    parse_macro_input!(attr with parser);

    let input = parse_macro_input!(item as ItemImpl);
    match expand(input, options) {
        Ok(expanded) => expanded.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(mut input: ItemImpl, options: Options) -> Result<proc_macro2::TokenStream> {
    match &input.trait_ {
        Some((None, path, _))
            if path
                .segments
                .last()
                .map_or(false, |s| s.ident == "PureFunction") => {}
        _ => {
            return Err(Error::new_spanned(
                &input.self_ty,
                "#[pure_function] must be placed on an `impl PureFunction for ..` block",
            ))
        }
    }
    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "generic pure functions are not supported",
        ));
    }
    let ident = match input.self_ty.as_ref() {
        Type::Path(path) => match path.path.segments.last() {
            Some(segment) => segment.ident.clone(),
            None => return Err(Error::new_spanned(&input.self_ty, "expected a type name")),
        },
        _ => return Err(Error::new_spanned(&input.self_ty, "expected a type name")),
    };

    isolation::check(input.to_token_stream())?;

    // If the attribute is used within `memoswarm` itself, paths start at
    // `crate` and the `linkme` attribute needs no override. Otherwise point
    // `linkme` at memoswarm's re-export so that users do not need to depend
    // on it.
    let memoswarm_path = if options.is_internal {
        quote! { crate }
    } else {
        quote! { ::memoswarm }
    };
    let linkme_path_override = if options.is_internal {
        quote! {}
    } else {
        quote! {
            #[linkme(crate=#memoswarm_path::__private::linkme)]
        }
    };

    let defines = |name: &str| {
        input
            .items
            .iter()
            .any(|item| matches!(item, ImplItem::Const(c) if c.ident == name))
    };
    let has_name = defines("NAME");
    let has_source = defines("SOURCE");

    if !has_source {
        let source = LitStr::new(&source_of(&input), Span::call_site());
        input.items.push(syn::parse_quote! {
            const SOURCE: &'static str = #source;
        });
    }
    if !has_name {
        let name = options
            .name
            .unwrap_or_else(|| LitStr::new(&snake_case(&ident.to_string()), ident.span()));
        input.items.push(syn::parse_quote! {
            const NAME: &'static str = #name;
        });
    } else if let Some(name) = options.name {
        return Err(Error::new_spanned(name, "NAME is already defined in the impl block"));
    }

    let self_ty = &input.self_ty;
    let register_fn = format_ident!("__memoswarm_register_{}", snake_case(&ident.to_string()));

    Ok(quote! {
        #input

        #[#memoswarm_path::__private::linkme::distributed_slice(#memoswarm_path::__private::FUNCTIONS)]
        #linkme_path_override
        fn #register_fn(
            registry: &#memoswarm_path::registry::Registry,
        ) -> #memoswarm_path::Result<#memoswarm_path::function::FnHandle> {
            registry.register(<#self_ty as ::core::default::Default>::default())
        }
    })
}

/// The tokens of the impl block with doc attributes removed.
fn source_of(input: &ItemImpl) -> String {
    let mut stripped = input.clone();
    let is_doc = |attr: &syn::Attribute| attr.path().is_ident("doc");
    stripped.attrs.retain(|a| !is_doc(a));
    for item in &mut stripped.items {
        match item {
            ImplItem::Const(c) => c.attrs.retain(|a| !is_doc(a)),
            ImplItem::Fn(f) => f.attrs.retain(|a| !is_doc(a)),
            ImplItem::Type(t) => t.attrs.retain(|a| !is_doc(a)),
            _ => {}
        }
    }
    stripped.to_token_stream().to_string()
}

fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).map_or(false, |n| n.is_lowercase());
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if prev_lower || (prev_upper && next_lower) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_names() {
        assert_eq!(snake_case("Add"), "add");
        assert_eq!(snake_case("WordCount"), "word_count");
        assert_eq!(snake_case("HTTPFetch"), "http_fetch");
        assert_eq!(snake_case("Sha256Sum"), "sha256_sum");
    }

    #[test]
    fn source_ignores_docs_and_formatting() {
        let a: ItemImpl = syn::parse_quote! {
            impl PureFunction for Add {
                /// Adds.
                fn execute(&self, input: AddInput, _: &CallContext) -> anyhow::Result<i64> {
                    Ok(input.a + input.b)
                }
            }
        };
        let b: ItemImpl = syn::parse_quote! {
            impl PureFunction for Add {
                fn execute(&self, input: AddInput, _: &CallContext) -> anyhow::Result<i64> { Ok(input.a + input.b) }
            }
        };
        assert_eq!(source_of(&a), source_of(&b));
    }

    #[test]
    fn expansion_fills_in_constants() {
        let input: ItemImpl = syn::parse_quote! {
            impl PureFunction for WordCount {
                type Input = WordCountInput;
                type Output = usize;
                fn execute(&self, input: WordCountInput, _: &CallContext) -> anyhow::Result<usize> {
                    Ok(input.text.split_whitespace().count())
                }
            }
        };
        let expanded = expand(input, Options::default()).unwrap().to_string();
        assert!(expanded.contains("const NAME"));
        assert!(expanded.contains("\"word_count\""));
        assert!(expanded.contains("const SOURCE"));
        assert!(expanded.contains("__memoswarm_register_word_count"));
        assert!(expanded.contains("FUNCTIONS"));
    }

    #[test]
    fn rejects_other_impls_and_generics() {
        let not_pure: ItemImpl = syn::parse_quote! {
            impl Display for Add {}
        };
        assert!(expand(not_pure, Options::default()).is_err());

        let generic: ItemImpl = syn::parse_quote! {
            impl<T> PureFunction for Wrap<T> {}
        };
        assert!(expand(generic, Options::default()).is_err());
    }
}
