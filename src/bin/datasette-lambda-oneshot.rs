//! "Oneshot" version of the Lambda.
//!
//! This executable does the full start-up sequence, then makes one `GET`
//! request for the path given on the command line and prints the result. It
//! reads the same environment variables as the deployed version, so set
//! `DbFiles` (and `Bucket`, `LAMBDA_TASK_ROOT`, etc.) before running it.

use lambda_http::{http, Body, Error};
use std::{env, io::Write};

use datasette_lambda::Services;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let mut args = env::args();
    args.next(); // skip argv[0]

    let path = args
        .next()
        .ok_or_else(|| -> Error { "first argument should be the request path".into() })?;

    let req = http::Request::builder()
        .method(http::Method::GET)
        .uri(path)
        .body(Body::Empty)?;

    let svcs = Services::init().await?;
    let resp = svcs.dispatch(req).await?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", resp.status())?;

    for (name, value) in resp.headers() {
        writeln!(stdout, "{}: {}", name, String::from_utf8_lossy(value.as_bytes()))?;
    }

    writeln!(stdout)?;
    stdout.write_all(resp.body())?;
    Ok(())
}
