use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("flowpipe {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: flowpipe");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("FLOWPIPE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "profile: {}",
        option_env!("FLOWPIPE_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!(
        "features: gateway={}, balancer={}, cli=true",
        cfg!(feature = "gateway"),
        cfg!(feature = "balancer")
    );
    println!("endpoints: tcp, tls, unix, ws, wss");

    Ok(SUCCESS)
}
