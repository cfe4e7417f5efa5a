//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[tokio_timeout_test]` drives an async test on its own runtime, and
//! `#[timeout]` guards a synchronous one. Both take an optional limit in seconds
//! (default 60). The async form also accepts `multi_thread` to run on a
//! multi-threaded runtime:
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(20, multi_thread)]
//! async fn negotiates() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Block, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    multi_thread: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            multi_thread: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                args.secs = secs;
            } else {
                let flag: Ident = input.parse()?;
                if flag != "multi_thread" {
                    return Err(syn::Error::new_spanned(flag, "expected a timeout in seconds or `multi_thread`"));
                }
                args.multi_thread = true;
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let mut function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    let runtime = if args.multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(2) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };
    let body = &function.block;
    let limit = timeout_duration(args.secs);
    let guarded = quote! {{
        let runtime = #runtime
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(#limit, async move #body)
                .await
                .expect("test timed out");
        });
    }};

    expand(function, args.secs, guarded, is_tokio_test_attribute)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    if args.multi_thread {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "`multi_thread` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let body = &function.block;
    let guarded = quote! { #body };
    expand(function, args.secs, guarded, is_test_attribute)
}

/// Runs `guarded` on a watchdog thread and reports its panic or a timeout.
fn expand(
    function: ItemFn,
    secs: u64,
    guarded: TokenStream2,
    strip: fn(&Attribute) -> bool,
) -> TokenStream {
    let ItemFn { attrs, vis, sig, .. } = function;
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|attr| !strip(attr)).collect();
    let limit = timeout_duration(secs);
    let body: Block = syn::parse_quote! {{
        let limit = #limit;
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #guarded));
            let _ = sender.send(outcome);
        });
        match receiver.recv_timeout(limit) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", limit)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }};

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig #body
    })
}

fn timeout_duration(secs: u64) -> TokenStream2 {
    quote! { std::time::Duration::from_secs(#secs) }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let path: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    path == ["tokio", "test"]
}

fn is_test_attribute(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}
