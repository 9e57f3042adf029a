use anyhow::{anyhow, bail, Context, Result};
use crabstream::testing::SyntheticCapture;
use crabstream::{
    AuthorizationGate, SessionDelegate, Stream, StreamState, StreamingConfiguration,
    StreamingSession, Subsystems, SystemAuthorization, VideoOrientation,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    crabstream::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: crabstream-cli <push|config> [args]");
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "push" => cmd_push(&args),
        "config" => cmd_config(&args),
        _ => {
            eprintln!("Unknown command: {}", command);
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<StreamingConfiguration> {
    match path {
        Some(path) => StreamingConfiguration::load_from_file(&path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(StreamingConfiguration::load_or_default()),
    }
}

fn cmd_config(args: &[String]) -> Result<()> {
    // Parse args: config [--config <file>] [--json]
    let mut path = None;
    let mut json = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                path = Some(PathBuf::from(
                    args.get(i).ok_or_else(|| anyhow!("--config needs a path"))?,
                ));
            }
            "--json" => json = true,
            other => bail!("unexpected argument: {}", other),
        }
        i += 1;
    }

    let config = load_config(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

struct PrintStates;

impl SessionDelegate for PrintStates {
    fn stream_state_did_change(&self, state: StreamState) {
        println!("state: {}", state);
    }

    fn capture_device_did_start(&self, kind: crabstream::DeviceKind) {
        println!("{} started", kind);
    }
}

fn cmd_push(args: &[String]) -> Result<()> {
    // Parse args: push <url> [--config <file>] [--seconds <n>]
    let mut url = None;
    let mut path = None;
    let mut seconds = 10u64;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                path = Some(PathBuf::from(
                    args.get(i).ok_or_else(|| anyhow!("--config needs a path"))?,
                ));
            }
            "--seconds" => {
                i += 1;
                seconds = args
                    .get(i)
                    .ok_or_else(|| anyhow!("--seconds needs a value"))?
                    .parse()?;
            }
            _ => {
                if url.is_none() {
                    url = Some(args[i].clone());
                }
            }
        }
        i += 1;
    }

    let url = url.ok_or_else(|| anyhow!("push URL required"))?;
    let config = load_config(path)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let stream = Stream::new(&url)?;
        let subsystems = Subsystems::with_capture(
            Arc::new(SyntheticCapture::new(&config).with_frame_size(320, 240)),
            AuthorizationGate::new(Arc::new(SystemAuthorization)),
            &config,
        );
        let session =
            StreamingSession::create(config, stream, VideoOrientation::Portrait, subsystems)?;

        let delegate: Arc<dyn SessionDelegate> = Arc::new(PrintStates);
        session.set_delegate(Arc::downgrade(&delegate));

        if !session.start_async().await {
            session.destroy();
            session.settle().await;
            bail!("could not start streaming to {}", url);
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            _ = tokio::signal::ctrl_c() => println!("interrupted"),
        }

        let stats = session.stats();
        session.destroy();
        session.settle().await;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        Ok(())
    })
}
