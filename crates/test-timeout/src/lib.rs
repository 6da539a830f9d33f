//! `#[tokio_timeout_test]`: runs an async test body on a fresh Tokio runtime
//! living on its own thread, failing the test when it exceeds the budget.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn default_budget() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 5, flavor = "multi_thread", trace)]
//! async fn tight_budget_with_logs() {}
//! ```
//!
//! `trace` installs a `tracing_subscriber` test writer honouring `RUST_LOG`,
//! so the calling crate needs `tracing-subscriber` as a dev-dependency.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, LitStr, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TestArgs {
    secs: u64,
    flavor: Flavor,
    trace: bool,
}

impl Default for TestArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            trace: false,
        }
    }
}

impl TestArgs {
    fn parse(&mut self, meta: syn::meta::ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            let secs: u64 = lit.base10_parse()?;
            if secs == 0 {
                return Err(meta.error("timeout must be greater than zero"));
            }
            self.secs = secs;
            Ok(())
        } else if meta.path.is_ident("flavor") {
            let lit: LitStr = meta.value()?.parse()?;
            self.flavor = match lit.value().as_str() {
                "current_thread" => Flavor::CurrentThread,
                "multi_thread" => Flavor::MultiThread,
                other => {
                    return Err(meta.error(format!("unknown runtime flavor `{other}`")));
                }
            };
            Ok(())
        } else if meta.path.is_ident("trace") {
            self.trace = true;
            Ok(())
        } else {
            Err(meta.error("expected `secs = N`, `flavor = \"...\"` or `trace`"))
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = TestArgs::default();
    let parser = syn::meta::parser(|meta| args.parse(meta));
    parse_macro_input!(attr with parser);

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
    let secs = args.secs;
    let runtime = runtime_builder(args.flavor);
    let tracing_init = if args.trace {
        quote! {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        }
    } else {
        TokenStream2::new()
    };
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(format!("test-{}", #name))
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        #tracing_init
                        let runtime = #runtime
                            .enable_all()
                            .build()
                            .expect("failed to build Tokio runtime");
                        runtime.block_on(async {
                            if tokio::time::timeout(budget, async move #block).await.is_err() {
                                panic!("{} timed out after {:?}", #name, budget);
                            }
                        });
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            // Grace period so the in-runtime timeout reports first.
            match done_rx.recv_timeout(budget + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} is blocking its runtime past {:?}", #name, budget)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} thread exited before reporting", #name)
                }
            }
        }
    })
}

fn runtime_builder(flavor: Flavor) -> TokenStream2 {
    match flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => quote! {
            tokio::runtime::Builder::new_multi_thread().worker_threads(2)
        },
    }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
