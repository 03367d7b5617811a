use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, Ident, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one against a fresh
/// server over the in-memory store, injecting its dependencies.
///
/// Injectable dependencies are [`rocket::local::asynchronous::Client`] and
/// `crate::clock::ManualClock`, which controls the server's notion of time.
/// With the `admin` argument, the client is logged in as the default admin.
#[proc_macro_attribute]
pub fn backend_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract the arguments to inject and reject invalid function signatures.
    let test_args = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    let maybe_login = match parse_macro_input!(args as Option<Ident>) {
        // Scoped so nothing still borrows the client when `setup` returns it.
        Some(arg) if arg == "admin" => quote! {
            {
                let config = rocket_client.rocket().state::<crate::config::Config>().unwrap();
                let response = rocket_client
                    .post(uri!(crate::api::auth::authenticate_admin))
                    .header(rocket::http::ContentType::JSON)
                    .body(rocket::serde::json::json!(config.default_admin()).to_string())
                    .dispatch()
                    .await;
                assert_eq!(response.status(), rocket::http::Status::Ok, "default admin could not log in");
            }
        },
        Some(arg) => {
            return syn::Error::new(arg.span(), "Expected `admin` or no argument")
                .into_compile_error()
                .into();
        }
        None => TokenStream2::new(),
    };

    quote! {
        #[test]
        fn #name() {
            /// Test setup.
            async fn setup(clock: crate::clock::ManualClock) -> rocket::local::asynchronous::Client {
                let rocket_client = rocket::local::asynchronous::Client::tracked(crate::rocket_for_tests(clock))
                    .await
                    .unwrap();

                #maybe_login

                rocket_client
            }

            /// The test itself.
            #item_fn

            let runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();

            let clock = crate::clock::ManualClock::default();
            let rocket_client = runtime.block_on(setup(clock.clone()));
            runtime.block_on(#new_name(#(#test_args),*));
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_client = false;
    let mut has_clock = false;
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let (Pat::Ident(_), Type::Path(type_path)) = (&*pat_type.pat, &*pat_type.ty) {
                if let Some(type_ident) = type_path.path.segments.last().map(|s| &s.ident) {
                    if type_ident == "Client" {
                        if has_client {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `rocket::local::asynchronous::Client`",
                            ));
                        }
                        has_client = true;
                        args.push(quote! { rocket_client });
                        continue;
                    } else if type_ident == "ManualClock" {
                        if has_clock {
                            return Err(syn::Error::new(input.span(), "Test cannot accept more than one `ManualClock`"));
                        }
                        has_clock = true;
                        args.push(quote! { clock });
                        continue;
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `client_ident: Client` or `clock_ident: ManualClock`",
        ));
    }

    Ok(args)
}
