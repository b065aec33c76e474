use flowpipe_gateway::{serve_http, HttpConfig};
use tracing::info;

use crate::cmd::gateway::{prepare, Prepared};
use crate::cmd::{interrupted, parse_duration, runtime, HttpServerArgs};
use crate::exit::{gateway_error, CliError, CliResult, SUCCESS};

pub fn run(args: HttpServerArgs) -> CliResult<i32> {
    let mut config = HttpConfig {
        request_timeout: parse_duration(&args.request_timeout)?,
        ..HttpConfig::default()
    };
    if let Some(max_body) = args.max_body {
        config.max_body = max_body;
    }

    let rt = runtime()?;
    let result = rt.block_on(async move {
        let Prepared {
            gateway,
            listener,
            input,
            output,
        } = prepare(&args.gateway).await?;

        tokio::select! {
            res = serve_http(&gateway, listener, config, input, output) => {
                res.map_err(|err| gateway_error("http server failed", err))?;
            }
            _ = interrupted() => info!("interrupted"),
        }
        Ok::<_, CliError>(SUCCESS)
    });
    rt.shutdown_background();
    result
}
