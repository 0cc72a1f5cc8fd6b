//! `#[tokio_timeout_test]`: run an async test on a fresh current-thread Tokio
//! runtime, failing it if it does not finish within a wall-clock budget.
//!
//! ```ignore
//! #[tokio_timeout_test]            // 60 s budget
//! #[tokio_timeout_test(5)]         // 5 s budget
//! #[tokio_timeout_test(5, paused)] // 5 s budget, Tokio clock starts paused
//! ```
//!
//! The budget is enforced by a watchdog on a separate OS thread, so it still
//! fires when the runtime's clock is paused and auto-advancing.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TestOptions {
    timeout_secs: u64,
    paused: bool,
}

enum TestOption {
    Timeout(LitInt),
    Flag(Ident),
}

impl Parse for TestOption {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(TestOption::Timeout)
        } else {
            input.parse().map(TestOption::Flag)
        }
    }
}

impl Parse for TestOptions {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut options = TestOptions {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        let items = Punctuated::<TestOption, Token![,]>::parse_terminated(input)?;
        for item in items {
            match item {
                TestOption::Timeout(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new(
                            lit.span(),
                            "timeout must be greater than zero",
                        ));
                    }
                    options.timeout_secs = secs;
                }
                TestOption::Flag(ident) if ident == "paused" => options.paused = true,
                TestOption::Flag(ident) => {
                    return Err(syn::Error::new(
                        ident.span(),
                        format!("unknown option `{ident}`, expected a timeout or `paused`"),
                    ));
                }
            }
        }
        Ok(options)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as TestOptions);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();
    let timeout = options.timeout_secs;
    let start_paused = if options.paused {
        quote! { builder.start_paused(true); }
    } else {
        quote! {}
    };
    let test_name = sig.ident.to_string();
    let thread_name = syn::LitStr::new(&test_name, Span::call_site());

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            let worker = std::thread::Builder::new().name(#thread_name.into());
            worker
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let mut builder = tokio::runtime::Builder::new_current_thread();
                        builder.enable_all();
                        #start_paused
                        let runtime = builder.build().expect("failed to build Tokio runtime");
                        runtime.block_on(async move #block);
                    }));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", timeout_duration)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
