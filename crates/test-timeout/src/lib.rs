//! `#[test_timeout::timeout]`: runs a synchronous test on its own thread and fails it
//! when it has not finished within the deadline (default 30 seconds). Lock-ordering
//! mistakes then surface as a failed test instead of a hung test binary.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_secs(attr.into()) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "timeout expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    expand(func, secs).into()
}

fn parse_secs(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse2(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn expand(func: ItemFn, secs: u64) -> TokenStream2 {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = func;
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_plain_test(a)).collect();
    let name = sig.ident.to_string();

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = ::std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(#name.to_string())
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(
                        ::std::panic::AssertUnwindSafe(|| #block),
                    );
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} did not finish within {}s", #name, #secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} thread exited without reporting", #name)
                }
            }
        }
    }
}

fn is_plain_test(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}
