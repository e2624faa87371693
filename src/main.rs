use std::env;

use clap::{Parser, Subcommand};
#[cfg(feature = "profiling")]
use profiling::puffin;
#[cfg(feature = "profiling")]
use puffin_http::Server;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vellum::config::Config;
use vellum_ipc::IpcMessage;

/// Command line arguments.
#[derive(Parser, Debug)]
#[clap(author, about, version, max_term_width = 80)]
struct Options {
    #[clap(subcommand)]
    pub subcommands: Option<Subcommands>,

    #[clap(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug)]
pub enum Subcommands {
    /// Send IPC messages to Vellum.
    #[clap(subcommand)]
    Msg(IpcMessage),
}

pub fn main() {
    #[cfg(feature = "profiling")]
    let _server = {
        puffin::set_scopes_on(true);
        Server::new(&format!("0.0.0.0:{}", puffin_http::DEFAULT_PORT)).unwrap()
    };

    // Setup logging.
    let directives = env::var("RUST_LOG").unwrap_or("warn,vellum=info".into());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    FmtSubscriber::builder().with_env_filter(env_filter).with_line_number(true).init();

    let options = Options::parse();
    match options.subcommands {
        Some(Subcommands::Msg(IpcMessage::Subscribe)) => {
            let result = vellum_ipc::subscribe(|event| println!("{event}"));
            if let Err(err) = result {
                eprintln!("\x1b[31merror\x1b[0m: {err}");
            }
        },
        Some(Subcommands::Msg(msg)) => match vellum_ipc::send_message(&msg) {
            Err(err) => eprintln!("\x1b[31merror\x1b[0m: {err}"),
            Ok(Some(IpcMessage::StatsReply { buffers, client_owned })) => {
                println!("buffers: {buffers}");
                println!("client owned: {client_owned}");
            },
            Ok(_) => (),
        },
        None => vellum::run(options.config),
    }
}

