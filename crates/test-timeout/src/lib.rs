//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[tokio_timeout_test]` runs an async test body on a current-thread Tokio
//! runtime, which matches the single dispatch loop the negotiator is built
//! around. `#[timeout]` wraps a synchronous test. Both take an optional
//! number of seconds (default 30).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Body {
    Async,
    Sync,
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(attr, item, Body::Async)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(attr, item, Body::Sync)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn parse_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn expand(attr: TokenStream, item: ItemFn, body: Body) -> syn::Result<TokenStream2> {
    let secs = parse_secs(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = item;

    match (body, sig.asyncness.is_some()) {
        (Body::Async, false) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "tokio_timeout_test can only be applied to async functions",
            ));
        }
        (Body::Sync, true) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "timeout expects a synchronous test function",
            ));
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let run = match body {
        Body::Async => quote! {
            let runtime = ::tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move {
                ::tokio::time::timeout(limit, async move #block)
                    .await
                    .expect("test timed out");
            });
        },
        Body::Sync => quote! { #block },
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                    #run
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would double-register the function.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
