//! Procedural macros for turnkit
//!
//! `#[turnkit::test]` turns an `async fn` into a `#[test]` that runs on a
//! freshly reset turnkit event loop.
//!
//! ```rust,ignore
//! use turnkit::prelude::*;
//!
//! #[turnkit::test]
//! async fn my_test(tracker: Tracker) {
//!     tracker.run_tracked(|| turnkit::schedule_microtask(|| {}));
//!     tracker.on_turn_end().next().await;
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    punctuated::Punctuated,
    Expr, ExprLit, FnArg, ItemFn, Lit, MetaNameValue, Pat, Signature, Token, Type,
};

/// Options accepted by `#[turnkit::test(...)]`.
#[derive(Default)]
struct TestConfig {
    timer_threshold_ms: Option<u64>,
    capture_errors: bool,
    long_stack_traces: bool,
    /// Leaves `Tracker::for_current` reuse on. Off unless asked for.
    context_reuse: bool,
}

impl TestConfig {
    fn apply(&mut self, option: &MetaNameValue) -> syn::Result<()> {
        let key = option
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new_spanned(&option.path, "expected a plain option name"))?
            .to_string();
        let Expr::Lit(ExprLit { lit, .. }) = &option.value else {
            return Err(syn::Error::new_spanned(&option.value, "expected a literal"));
        };

        match (key.as_str(), lit) {
            ("timer_threshold_ms", Lit::Int(ms)) => self.timer_threshold_ms = Some(ms.base10_parse()?),
            ("capture_errors", Lit::Bool(flag)) => self.capture_errors = flag.value,
            ("long_stack_traces", Lit::Bool(flag)) => self.long_stack_traces = flag.value,
            ("context_reuse", Lit::Bool(flag)) => self.context_reuse = flag.value,
            ("timer_threshold_ms", other) => {
                return Err(syn::Error::new_spanned(other, "`timer_threshold_ms` takes an integer"));
            }
            ("capture_errors" | "long_stack_traces" | "context_reuse", other) => {
                return Err(syn::Error::new_spanned(other, format!("`{key}` takes a bool")));
            }
            _ => {
                return Err(syn::Error::new_spanned(
                    &option.path,
                    format!("unsupported turnkit::test option `{key}`"),
                ));
            }
        }
        Ok(())
    }

    fn threshold_tokens(&self) -> TokenStream2 {
        match self.timer_threshold_ms {
            Some(ms) => quote! { ::core::option::Option::Some(::std::time::Duration::from_millis(#ms)) },
            None => quote! { ::core::option::Option::None },
        }
    }
}

impl Parse for TestConfig {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let options = Punctuated::<MetaNameValue, Token![,]>::parse_terminated(input)?;
        let mut config = Self::default();
        for option in &options {
            config.apply(option)?;
        }
        Ok(config)
    }
}

/// Finds the binding of the optional `Tracker` parameter.
///
/// Any other parameter, or a second tracker, is rejected.
fn injected_tracker(sig: &Signature) -> syn::Result<Option<&Pat>> {
    let mut found = None;
    for arg in &sig.inputs {
        let FnArg::Typed(typed) = arg else {
            return Err(syn::Error::new_spanned(arg, "test functions cannot take `self`"));
        };
        let names_tracker = matches!(
            &*typed.ty,
            Type::Path(path) if path.path.segments.last().is_some_and(|seg| seg.ident == "Tracker")
        );
        if !names_tracker {
            return Err(syn::Error::new_spanned(arg, "only a `Tracker` parameter can be injected"));
        }
        if found.replace(&*typed.pat).is_some() {
            return Err(syn::Error::new_spanned(arg, "duplicate `Tracker` parameter"));
        }
    }
    Ok(found)
}

/// Runs an `async fn` test on turnkit's event loop.
///
/// Before the body starts the thread's loop is reset, the context cache is
/// cleared and context reuse is switched off, so turn boundaries do not leak
/// between tests.
///
/// ```rust,ignore
/// #[turnkit::test]
/// async fn sleeps_in_virtual_time() {
///     turnkit::scheduler::sleep(Duration::from_secs(5)).await;
/// }
/// ```
///
/// A `tracker: Tracker` parameter receives a tracker forked from the root
/// context and configured from the attribute:
///
/// ```rust,ignore
/// #[turnkit::test(timer_threshold_ms = 100)]
/// async fn settles(tracker: Tracker) {
///     tracker.run_tracked(|| turnkit::create_timer(Duration::from_millis(10), || {}));
///     tracker.on_async_done().next().await;
/// }
/// ```
///
/// Options:
///
/// - `timer_threshold_ms = N`: track timers shorter than N ms (0 tracks all)
/// - `capture_errors = true`: publish uncaught errors on `on_error`
/// - `long_stack_traces = true`: attach scheduling sites to captured errors
/// - `context_reuse = true`: keep `Tracker::for_current` reuse enabled
///
/// The generated test panics if the body is still pending once the loop has
/// nothing left to run.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let expanded = syn::parse::<TestConfig>(attr)
        .and_then(|config| Ok((config, syn::parse::<ItemFn>(item)?)))
        .and_then(|(config, func)| expand_test(&config, &func));
    expanded.unwrap_or_else(syn::Error::into_compile_error).into()
}

fn expand_test(config: &TestConfig, func: &ItemFn) -> syn::Result<TokenStream2> {
    if func.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            func.sig.fn_token,
            "#[turnkit::test] needs an `async fn`",
        ));
    }
    let tracker = injected_tracker(&func.sig)?;

    let ItemFn { attrs, vis, sig, block } = func;
    let name = &sig.ident;
    let context_reuse = config.context_reuse;

    let make_tracker = tracker.map(|binding| {
        let threshold = config.threshold_tokens();
        let capture_errors = config.capture_errors;
        let long_stack_traces = config.long_stack_traces;
        quote! {
            let #binding = ::turnkit::Tracker::with_config(::turnkit::TrackerConfig {
                timer_threshold: #threshold,
                capture_errors: #capture_errors,
                long_stack_traces: #long_stack_traces,
            });
        }
    });

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() {
            let event_loop = ::turnkit::scheduler::EventLoop::current();
            event_loop.reset();
            ::turnkit::clear_context_cache();
            ::turnkit::set_context_reuse(#context_reuse);
            #make_tracker
            if let ::core::result::Result::Err(error) = event_loop.block_on(async move #block) {
                panic!("test body did not complete: {error}");
            }
        }
    })
}
