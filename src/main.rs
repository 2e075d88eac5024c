use std::io::Write;
use std::path::PathBuf;
use anyhow::anyhow;
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use log::info;
use simplelog::TermLogger;
use termcolor::{Color, ColorSpec, StandardStream, WriteColor};

use bottler::{Bottle, Bottler, Config, DllOverride, ExitStatus, Overlay, OverlayPatch};

fn parse_key_val(s: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = s.split_once('=').ok_or_else(|| anyhow!("expected KEY=VALUE, got \"{s}\""))?;
    if key.is_empty() {
        return Err(anyhow!("empty key in \"{s}\""));
    }

    Ok((key.to_owned(), value.to_owned()))
}

fn find_bottle(state: &Bottler, name_or_id: &str) -> Result<Bottle, Box<dyn std::error::Error>> {
    state.bottles().lookup(name_or_id)?
        .ok_or_else(|| format!("no bottle named {name_or_id}").into())
}

fn list_bottles(state: &Bottler) -> Result<(), bottler::Error> {
    let bottles = state.list()?;
    if bottles.is_empty() {
        println!("No bottles.");
        return Ok(());
    }

    let mut stdout = StandardStream::stdout(termcolor::ColorChoice::Auto);
    for (i, bottle) in bottles.iter().enumerate() {
        if bottle.is_corrupt() {
            stdout.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
        } else if i == 0 {
            stdout.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
        }

        writeln!(
            &mut stdout,
            "{}  {}  {}  {}",
            bottle.name(),
            bottle.id(),
            bottle.runner(),
            bottle.last_used().format("%Y-%m-%d %H:%M")
        )?;
        stdout.reset()?;
    }

    Ok(())
}

fn list_runners(state: &Bottler) {
    let runners = state.runners().list();
    if runners.is_empty() {
        println!("No runners.");
        return;
    }

    for runner in runners {
        println!("{} ({}) {}", runner.id(), runner.version(), runner.executable().display());
    }
}

fn print_header(header: &str) {
    let mut stdout = StandardStream::stdout(termcolor::ColorChoice::Auto);

    let mut header_spec = ColorSpec::new();
    header_spec.set_bold(true);
    header_spec.set_underline(true);

    let _ = stdout.set_color(&header_spec);
    println!("{header}:");
    let _ = stdout.reset();
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long)]
    verbose: bool,

    /// config file to use instead of the default
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Option<Subcommands>
}

#[derive(Subcommand)]
enum Subcommands {
    /// create a new bottle
    Create {
        /// name of the bottle
        name: String,

        /// runner the bottle uses
        #[arg(long)]
        runner: String,

        /// initial environment variable, as KEY=VALUE
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
    },

    /// delete a bottle and everything in it
    Delete {
        /// name or id of the bottle
        bottle: String,

        /// do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// change a bottle's environment variables
    Configure {
        /// name or id of the bottle
        bottle: String,

        /// set a variable, as KEY=VALUE
        #[arg(long = "set", value_parser = parse_key_val)]
        set: Vec<(String, String)>,

        /// remove a variable
        #[arg(long = "unset")]
        unset: Vec<String>,
    },

    /// move a bottle to another runner
    SetRunner {
        /// name or id of the bottle
        bottle: String,

        runner: String,
    },

    /// override how a dll is loaded
    Dll {
        /// name or id of the bottle
        bottle: String,

        /// dll to override, eg. d3d11
        dll: String,

        /// n, b, n,b, b,n or disabled
        #[arg(long, default_value = "n,b")]
        mode: DllOverride,

        /// remove the override instead
        #[arg(long)]
        remove: bool,
    },

    /// list bottles, most recently used first
    List,

    /// list available runners
    Runners,

    /// run a program inside a bottle and wait for it
    Run {
        /// name or id of the bottle
        bottle: String,

        /// executable, relative to the bottle or absolute
        executable: PathBuf,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn exit_code(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Code(code) => code,
        ExitStatus::Signal(signal) => 128 + signal,
        ExitStatus::Unknown => 1,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    TermLogger::init(
        if cli.verbose {
            simplelog::LevelFilter::Info
        } else {
            simplelog::LevelFilter::Warn
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let state = Bottler::open(config)?;

    match cli.subcommand {
        Some(Subcommands::Create { name, runner, env }) => {
            let bottle = state.create(&name, &runner, env.into_iter().collect::<Overlay>())?;
            println!("{}", bottle.id());
        }
        Some(Subcommands::Delete { bottle, yes }) => {
            let bottle = find_bottle(&state, &bottle)?;
            let confirmed = yes || Confirm::new()
                .with_prompt(format!("Delete {} and everything installed in it?", bottle.name()))
                .default(false)
                .interact()?;

            if confirmed {
                state.delete(bottle.id())?;
            }
        }
        Some(Subcommands::Configure { bottle, set, unset }) => {
            let bottle = find_bottle(&state, &bottle)?;
            let patch = set.into_iter()
                .map(|(k, v)| (k, Some(v)))
                .chain(unset.into_iter().map(|k| (k, None)))
                .collect::<OverlayPatch>();
            state.configure(bottle.id(), &patch)?;
        }
        Some(Subcommands::SetRunner { bottle, runner }) => {
            let bottle = find_bottle(&state, &bottle)?;
            state.bottles().set_runner(bottle.id(), &runner)?;
        }
        Some(Subcommands::Dll { bottle, dll, mode, remove }) => {
            let bottle = find_bottle(&state, &bottle)?;
            state.bottles().set_dll_override(bottle.id(), &dll, (!remove).then_some(mode))?;
        }
        Some(Subcommands::List) => list_bottles(&state)?,
        Some(Subcommands::Runners) => list_runners(&state),
        Some(Subcommands::Run { bottle, executable, args }) => {
            let bottle = find_bottle(&state, &bottle)?;
            info!("Running {} in {}", executable.display(), bottle.name());

            let mut session = state.launch(bottle.id(), &executable, &args)?;
            let status = state.wait(&mut session)?;
            info!("{} exited with {status}", executable.display());
            std::process::exit(exit_code(status));
        }
        None => {
            print_header("Runners");
            list_runners(&state);
            println!();
            print_header("Bottles");
            list_bottles(&state)?;
        }
    }

    Ok(())
}
