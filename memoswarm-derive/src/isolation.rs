//! A best-effort check that a function body does not read ambient state.
//!
//! The check walks the tokens of the impl block and rejects `unsafe`,
//! `static` items, and paths into modules that expose clocks, randomness,
//! the environment, the filesystem, the network, processes, or threads. It
//! only sees what is written in the block: code reached through other
//! functions is not checked.
use proc_macro2::{Delimiter, TokenStream, TokenTree};
use syn::{Error, Result};

/// Modules that may not be named under `std`, `core`, or `tokio`.
const AMBIENT_MODULES: &[&str] = &["env", "fs", "net", "process", "time", "thread"];

/// Crates and items that may not be named anywhere.
const AMBIENT_NAMES: &[&str] = &[
    "rand",
    "getrandom",
    "thread_rng",
    "SystemTime",
    "Instant",
    "UNIX_EPOCH",
];

const ROOTS: &[&str] = &["std", "core", "tokio"];

pub(crate) fn check(tokens: TokenStream) -> Result<()> {
    let mut errors: Option<Error> = None;
    walk(tokens, &mut |err| match &mut errors {
        None => errors = Some(err),
        Some(errors) => errors.combine(err),
    });
    match errors {
        None => Ok(()),
        Some(errors) => Err(errors),
    }
}

fn walk(tokens: TokenStream, report: &mut impl FnMut(Error)) {
    let tokens: Vec<TokenTree> = tokens.into_iter().collect();
    // The root of the path the current token continues, if any.
    let mut path_root: Option<String> = None;

    for (i, token) in tokens.iter().enumerate() {
        let follows_path_sep = i >= 2 && is_punct(&tokens[i - 1], ':') && is_punct(&tokens[i - 2], ':');
        match token {
            TokenTree::Ident(ident) => {
                let name = ident.to_string();
                let is_lifetime = i >= 1 && is_punct(&tokens[i - 1], '\'');

                if name == "unsafe" {
                    report(Error::new(ident.span(), "pure functions must not use `unsafe`"));
                } else if name == "static" && !is_lifetime {
                    report(Error::new(
                        ident.span(),
                        "pure functions must not declare `static` items",
                    ));
                } else if AMBIENT_NAMES.contains(&name.as_str()) {
                    report(ambient(ident.span(), &name));
                } else if follows_path_sep {
                    if let Some(root) = &path_root {
                        if ROOTS.contains(&root.as_str()) && AMBIENT_MODULES.contains(&name.as_str()) {
                            report(ambient(ident.span(), &format!("{root}::{name}")));
                        }
                    }
                }

                if !follows_path_sep || path_root.is_none() {
                    path_root = Some(name);
                }
            }
            TokenTree::Group(group) => {
                // `use std::{env, fs}` names the modules inside a brace group.
                if group.delimiter() == Delimiter::Brace && follows_path_sep {
                    if let Some(root) = path_root.as_deref().filter(|r| ROOTS.contains(r)) {
                        for inner in group.stream() {
                            if let TokenTree::Ident(ident) = inner {
                                let name = ident.to_string();
                                if AMBIENT_MODULES.contains(&name.as_str()) {
                                    report(ambient(ident.span(), &format!("{root}::{name}")));
                                }
                            }
                        }
                    }
                }
                walk(group.stream(), report);
                path_root = None;
            }
            TokenTree::Punct(punct) if punct.as_char() == ':' => {}
            _ => path_root = None,
        }
    }
}

fn is_punct(token: &TokenTree, c: char) -> bool {
    matches!(token, TokenTree::Punct(p) if p.as_char() == c)
}

fn ambient(span: proc_macro2::Span, what: &str) -> Error {
    Error::new(
        span,
        format!("pure functions must not use `{what}`: it reads ambient state"),
    )
}

#[cfg(test)]
mod tests {
    use quote::quote;

    use super::*;

    #[test]
    fn plain_code_passes() {
        let tokens = quote! {
            impl PureFunction for Add {
                const NAME: &'static str = "add";
                fn execute(&self, input: AddInput, ctx: &CallContext) -> anyhow::Result<i64> {
                    let total: i64 = std::iter::once(input.a).chain([input.b]).sum();
                    Ok(core::cmp::max(total, 0))
                }
            }
        };
        assert!(check(tokens).is_ok());
    }

    #[test]
    fn ambient_paths_are_rejected() {
        for tokens in [
            quote! { fn f() { std::env::var("HOME"); } },
            quote! { fn f() { ::std::fs::read("x"); } },
            quote! { fn f() { let t = std::time::SystemTime::now(); } },
            quote! { fn f() { tokio::time::sleep(d); } },
            quote! { fn f() { let x: u8 = rand::random(); } },
            quote! { fn f() { let now = Instant::now(); } },
            quote! { use std::{env, collections::HashMap}; },
            quote! { fn f() { unsafe { g() } } },
            quote! { fn f() { static mut COUNTER: u8 = 0; } },
        ] {
            assert!(check(tokens.clone()).is_err(), "{tokens}");
        }
    }

    #[test]
    fn unrelated_names_pass() {
        // Only the path root decides; a local `env` or `time` is fine.
        let tokens = quote! {
            fn f(env: &Env, time: u64) -> u64 { env.offset + time }
        };
        assert!(check(tokens).is_ok());
    }
}
