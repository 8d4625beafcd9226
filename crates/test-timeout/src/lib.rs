//! `#[tokio_timeout_test]`: run an async test on its own current-thread
//! runtime and fail it after a wall-clock deadline.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn default_deadline() {}
//!
//! #[test_timeout::tokio_timeout_test(20, start_paused)]
//! async fn virtual_time() {}
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct Options {
    timeout_secs: u64,
    start_paused: bool,
}

enum Arg {
    Secs(LitInt),
    Flag(Ident),
}

impl Parse for Arg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(Arg::Secs)
        } else {
            input.parse().map(Arg::Flag)
        }
    }
}

impl Parse for Options {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut options = Options {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            start_paused: false,
        };
        for arg in Punctuated::<Arg, Token![,]>::parse_terminated(input)? {
            match arg {
                Arg::Secs(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                    }
                    options.timeout_secs = secs;
                }
                Arg::Flag(flag) if flag == "start_paused" => options.start_paused = true,
                Arg::Flag(flag) => {
                    return Err(syn::Error::new_spanned(
                        &flag,
                        format!("unknown option `{flag}`; expected a timeout in seconds or `start_paused`"),
                    ));
                }
            }
        }
        Ok(options)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let Options {
        timeout_secs,
        start_paused,
    } = parse_macro_input!(attr as Options);

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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .start_paused(#start_paused)
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
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
