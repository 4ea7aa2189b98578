//! The deployed Lambda executable.
//!
//! This executable defines a server that expects to be interacted with
//! according to AWS API Gateway's "proxy event" protocol. `lambda_http` turns
//! each event into an ordinary HTTP request and turns our response back into
//! the JSON shape that the gateway wants.

use lambda_http::{run, service_fn, Error, Request};

use datasette_lambda::Services;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let svcs = Services::init().await?;
    let ref_svcs = &svcs;

    run(service_fn(|req: Request| async move {
        ref_svcs.dispatch(req).await
    }))
    .await?;
    Ok(())
}
