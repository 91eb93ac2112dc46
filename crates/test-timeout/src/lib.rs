use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Arguments accepted by both attributes: `(secs)`, `(worker_threads = N)`,
/// or `(secs, worker_threads = N)`.
struct TimeoutArgs {
    secs: u64,
    worker_threads: Option<(usize, proc_macro2::Span)>,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            worker_threads: None,
        };

        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = lit.base10_parse()?;
            if args.secs == 0 {
                return Err(syn::Error::new(
                    lit.span(),
                    "timeout must be greater than zero",
                ));
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        while !input.is_empty() {
            let name: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            let value: LitInt = input.parse()?;
            match name.to_string().as_str() {
                "worker_threads" => {
                    let threads: usize = value.base10_parse()?;
                    if threads == 0 {
                        return Err(syn::Error::new(
                            value.span(),
                            "worker_threads must be greater than zero",
                        ));
                    }
                    args.worker_threads = Some((threads, name.span()));
                }
                other => {
                    return Err(syn::Error::new(
                        name.span(),
                        format!("unknown argument `{other}`"),
                    ))
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(args)
    }
}

/// Runs `body` on a helper thread and fails the test if it does not report back in time.
fn timed_harness(timeout_secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
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
}

/// Async test on a fresh Tokio runtime, bounded by a wall-clock timeout.
///
/// The runtime is current-thread unless `worker_threads = N` is given, in which
/// case a multi-thread runtime with `N` workers is built.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);

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

    let builder = match args.worker_threads {
        Some((threads, _)) => quote! {
            tokio::runtime::Builder::new_multi_thread().worker_threads(#threads)
        },
        None => quote! { tokio::runtime::Builder::new_current_thread() },
    };

    let timeout = args.secs;
    let body = quote! {{
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    }};
    let harness = timed_harness(timeout, body);

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #harness
        }
    })
}

/// Synchronous test bounded by a wall-clock timeout.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);

    if let Some((_, span)) = args.worker_threads {
        return syn::Error::new(span, "worker_threads only applies to tokio_timeout_test")
            .to_compile_error()
            .into();
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let harness = timed_harness(args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #harness
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

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
