//! Connect to Telegram with courier and make one call on each kind of session.
//!
//! 1. Start the primary session on DC2 (test servers unless `--prod`)
//! 2. Call `help.getConfig` and print the answer's constructor
//! 3. Open the media session for the same DC and repeat the call there
//! 4. Close everything
//!
//! The auth key lands in `./connect.session`; a second run skips the DH
//! exchange.
//!
//! # Run
//! ```text
//! cargo run -p courier-connect -- [--prod] [--dc N]
//! ```

use courier_client::{Client, Config};

/// `help.getConfig#c4f9186b = Config`
const HELP_GET_CONFIG: u32 = 0xc4f9186b;

struct Args {
    prod:  bool,
    dc_id: i32,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args { prod: false, dc_id: 2 };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--prod" => args.prod = true,
            "--dc" => {
                let v = it.next().ok_or("--dc needs a value")?;
                args.dc_id = v.parse().map_err(|_| format!("bad DC id {v:?}"))?;
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("courier_client=info")).init();
    if let Err(e) = run().await {
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args()?;
    let config = Config::default()
        .with_account("connect")
        .with_test_mode(!args.prod)
        .with_home_dc(args.dc_id);

    let client = Client::new(config)?;
    println!("🔌 Connecting to DC{} ({})…", args.dc_id, if args.prod { "production" } else { "test" });
    client.start().await?;

    let request = HELP_GET_CONFIG.to_le_bytes();
    let answer = client.invoke(&request).await?;
    println!("✓ primary: {} bytes, constructor {:#010x}", answer.len(), constructor(&answer));

    let media = client.media_session(args.dc_id).await?;
    let answer = media.invoke(&request).await?;
    println!("✓ media {}: {} bytes, constructor {:#010x}", media.endpoint(), answer.len(), constructor(&answer));

    client.close().await;
    println!("👋 closed");
    Ok(())
}

fn constructor(body: &[u8]) -> u32 {
    body.get(..4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])).unwrap_or(0)
}
