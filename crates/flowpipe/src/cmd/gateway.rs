use flowpipe_frame::{FbpCodec, Frame};
use flowpipe_gateway::{ConfigLayer, Gateway};
use flowpipe_transport::Listener;
use futures_util::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use crate::cmd::{interrupted, open_input, open_output, runtime, FrameInput, FrameOutput, GatewayArgs};
use crate::exit::{frame_error, gateway_error, transport_error, CliError, CliResult, SUCCESS};

pub fn run(args: GatewayArgs) -> CliResult<i32> {
    let rt = runtime()?;
    let result = rt.block_on(async move {
        let prepared = prepare(&args).await?;
        let Prepared {
            gateway,
            listener,
            input,
            output,
        } = prepared;

        tokio::select! {
            res = gateway.serve_framed(listener, input, output) => {
                res.map_err(|err| gateway_error("gateway failed", err))?;
            }
            _ = interrupted() => info!("interrupted"),
        }
        Ok::<_, CliError>(SUCCESS)
    });
    // A pending stdin read would otherwise hold up runtime drop.
    rt.shutdown_background();
    result
}

pub(crate) struct Prepared {
    pub gateway: Gateway,
    pub listener: Listener,
    pub input: FramedRead<FrameInput, FbpCodec>,
    pub output: FrameOutput,
}

/// Resolve configuration (flags, then IIP), bind the endpoint and open the
/// shared streams.
pub(crate) async fn prepare(args: &GatewayArgs) -> CliResult<Prepared> {
    let mut layer = args.layer()?;
    let mut input = FramedRead::new(
        open_input(args.streams.input.as_deref()).await?,
        FbpCodec::new(),
    );

    if args.iip {
        let iip = read_iip(&mut input).await?;
        let from_iip = ConfigLayer::from_iip(&iip)
            .map_err(|err| gateway_error("invalid IIP", err))?;
        debug!(?from_iip, "configuration from IIP");
        layer = layer.merge(from_iip);
    }

    let config = layer
        .build()
        .map_err(|err| gateway_error("invalid configuration", err))?;
    let gateway = Gateway::new(config).map_err(|err| gateway_error("gateway setup failed", err))?;
    let listener = Listener::bind(&gateway.config().endpoint)
        .await
        .map_err(|err| transport_error("bind failed", err))?;
    let output = open_output(args.streams.output.as_deref()).await?;

    Ok(Prepared {
        gateway,
        listener,
        input,
        output,
    })
}

async fn read_iip(input: &mut FramedRead<FrameInput, FbpCodec>) -> CliResult<Frame> {
    match input.next().await {
        Some(Ok(frame)) if frame.is_data() => Ok(frame),
        Some(Ok(frame)) => Err(CliError::config(format!(
            "expected an IIP data frame, got {}.{}",
            frame.frame_type, frame.body_type
        ))),
        Some(Err(err)) => Err(frame_error("cannot read IIP", err)),
        None => Err(CliError::config("input ended before the IIP")),
    }
}
