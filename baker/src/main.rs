use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use baker::texture_mesh;
use base::defs::{Error, ErrorKind::*, Result};

#[derive(StructOpt)]
#[structopt(about = "Multi-view texture atlas baker")]
struct Opts {
    #[structopt(help = "Log debug messages", long, short = "v")]
    verbose: bool,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    TextureMesh(texture_mesh::TextureMeshParams),
}

fn init_logger(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .map_err(|e| {
        let desc = "failed to init logger".to_string();
        Error::with_source(InconsistentState, desc, e)
    })
}

fn main() {
    let opts = Opts::from_args();

    let res = init_logger(opts.verbose).and_then(|_| match &opts.command {
        Command::TextureMesh(params) => {
            texture_mesh::texture_mesh_with_params(params)
        }
    });

    if let Err(err) = res {
        eprintln!("error: {:?}", err);
        std::process::exit(1);
    }
}
