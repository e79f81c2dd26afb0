//! pkr CLI - template environments into kards, then build and deploy them

use clap::{ArgAction, Args, Parser, Subcommand};
use console::style;
use std::path::PathBuf;

mod commands;
mod display;
mod error;
mod exit_codes;
mod logging;

use commands::Globals;
use error::{CliError, Result};

#[derive(Parser)]
#[command(name = "pkr")]
#[command(version)]
#[command(about = "Render environments into kards, build their images and deploy them", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Directory inside the pkr tree
    #[arg(long, env = "PKR_PATH", global = true)]
    pkr_path: Option<PathBuf>,

    /// Kard to use instead of the current one
    #[arg(long, env = "PKR_KARD", global = true)]
    kard: Option<String>,
}

/// Services to act on; every service when none is given
#[derive(Args, Debug, Default)]
struct ServiceArgs {
    #[arg(value_name = "SERVICE")]
    services: Vec<String>,

    #[arg(short = 's', long = "services", num_args = 1.., value_name = "SERVICE")]
    named: Vec<String>,
}

impl ServiceArgs {
    fn into_list(self) -> Vec<String> {
        let mut services = self.services;
        services.extend(self.named);
        services
    }
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Image tag, meta `tag` by default
    #[arg(short, long)]
    tag: Option<String>,

    /// Build without cache
    #[arg(short, long)]
    nocache: bool,

    /// Number of parallel builds
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Skip images that already exist
    #[arg(short = 'b', long)]
    no_rebuild: bool,

    /// Build stage
    #[arg(long)]
    target: Option<String>,

    /// Recreate the buildx builder first
    #[arg(long)]
    clean_builder: bool,

    #[command(flatten)]
    services: ServiceArgs,
}

#[derive(Args, Debug)]
struct RegistryArgs {
    /// Registry URL, meta `registry` by default
    #[arg(short, long)]
    registry: Option<String>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(short, long)]
    password: Option<String>,

    /// Image tag, meta `tag` by default
    #[arg(short, long)]
    tag: Option<String>,

    /// Number of parallel transfers
    #[arg(long)]
    parallel: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, render and select kards
    #[command(subcommand)]
    Kard(KardCommand),

    /// Manage the images of the current kard
    #[command(subcommand)]
    Image(ImageCommand),

    /// Build images (same as `image build`)
    Build(BuildArgs),

    /// Render the kard if needed, then start services
    Up(ServiceArgs),

    /// Stop services
    Down(ServiceArgs),

    /// Start services from the rendered kard
    Start(ServiceArgs),

    /// Stop services (same as `down`)
    Stop(ServiceArgs),

    /// Restart services
    Restart(ServiceArgs),

    /// Stop and remove what the kard deployed
    Clean {
        /// Kill containers before removing them
        #[arg(short, long)]
        kill: bool,
    },

    /// List running services
    Ps,

    /// List the features of the current kard
    Listext {
        /// Every available feature
        #[arg(short, long)]
        all: bool,
    },

    /// Create a pkr tree
    Init {
        /// Where to create it
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum KardCommand {
    /// Create a kard and make it current
    Create {
        name: String,

        /// Environment name under env/
        #[arg(short, long, default_value = "dev")]
        env: String,

        /// Driver, meta `driver.name` or compose by default
        #[arg(short, long)]
        driver: Option<String>,

        /// YAML file with meta values
        #[arg(short, long)]
        meta: Option<PathBuf>,

        /// Comma-separated features
        #[arg(short, long)]
        features: Option<String>,

        /// Meta values as key=value, dotted keys nest
        #[arg(long, num_args = 1.., value_name = "KEY=VALUE")]
        extra: Vec<String>,
    },

    /// Add overrides to the current kard and resolve it again
    Update {
        #[arg(short, long)]
        meta: Option<PathBuf>,

        #[arg(short, long)]
        features: Option<String>,

        #[arg(long, num_args = 1.., value_name = "KEY=VALUE")]
        extra: Vec<String>,
    },

    /// Render the driver outputs into the current kard
    Make {
        /// Keep files that are no longer produced
        #[arg(long, visible_alias = "update")]
        no_reset: bool,
    },

    /// List kards
    List {
        /// Include kards deployed in the cluster
        #[arg(short, long)]
        kubernetes: bool,
    },

    /// Show the current kard
    Get,

    /// Make a kard current
    Load { name: String },

    /// Print the meta of the current kard
    Dump {
        /// Only the values given on the command line
        #[arg(short, long)]
        cleaned: bool,
    },

    /// Delete a kard directory
    Remove { name: String },
}

#[derive(Subcommand)]
enum ImageCommand {
    /// Build images
    Build(BuildArgs),

    /// Push images to a registry
    Push {
        #[command(flatten)]
        registry: RegistryArgs,

        /// Additional tags to push
        #[arg(short, long, num_args = 1..)]
        other_tags: Vec<String>,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Pull images from a registry and tag them locally
    Pull {
        #[command(flatten)]
        registry: RegistryArgs,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// List the image names of the kard
    List {
        #[arg(long)]
        tag: Option<String>,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Remove local images of the kard
    Purge {
        /// Only this tag
        #[arg(long)]
        tag: Option<String>,

        /// Every tag but this one
        #[arg(long)]
        except_tag: Option<String>,

        /// Also references in this repository
        #[arg(long)]
        repository: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    miette::set_panic_hook();

    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet);

    let result = tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => Err(CliError::Cancelled),
    };

    if let Err(err) = result {
        report(&err);
        std::process::exit(err.exit_code());
    }
}

/// One classification line, then details when there are any
fn report(err: &CliError) {
    eprintln!(
        "{} {}",
        style(format!("error[{}]:", err.kind())).for_stderr().red().bold(),
        err
    );
    match err {
        CliError::Template(te) => eprintln!("{:?}", miette::Report::new(te.clone())),
        CliError::Config {
            help: Some(help), ..
        } => eprintln!("  {} {}", style("help:").for_stderr().blue(), help),
        _ => {}
    }
}

async fn run(cli: Cli) -> Result<()> {
    let globals = Globals {
        pkr_path: cli.pkr_path,
        kard: cli.kard,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Init { path } => commands::init::run(&path),

        Commands::Kard(command) => match command {
            KardCommand::Create {
                name,
                env,
                driver,
                meta,
                features,
                extra,
            } => commands::kard::create(
                &globals,
                &name,
                &env,
                driver,
                meta.as_deref(),
                features.as_deref(),
                &extra,
            ),
            KardCommand::Update {
                meta,
                features,
                extra,
            } => commands::kard::update(&globals, meta.as_deref(), features.as_deref(), &extra),
            KardCommand::Make { no_reset } => commands::kard::make(&globals, !no_reset),
            KardCommand::List { kubernetes } => commands::kard::list(&globals, kubernetes).await,
            KardCommand::Get => commands::kard::get(&globals),
            KardCommand::Load { name } => commands::kard::load(&globals, &name),
            KardCommand::Dump { cleaned } => commands::kard::dump(&globals, cleaned),
            KardCommand::Remove { name } => commands::kard::remove(&globals, &name),
        },

        Commands::Image(command) => match command {
            ImageCommand::Build(args) => build(&globals, args).await,
            ImageCommand::Push {
                registry,
                other_tags,
                services,
            } => {
                let options = registry_options(registry, other_tags);
                commands::image::push(&globals, &services.into_list(), &options).await
            }
            ImageCommand::Pull { registry, services } => {
                let options = registry_options(registry, Vec::new());
                commands::image::pull(&globals, &services.into_list(), &options).await
            }
            ImageCommand::List { tag, services } => {
                commands::image::list(&globals, &services.into_list(), tag.as_deref())
            }
            ImageCommand::Purge {
                tag,
                except_tag,
                repository,
            } => {
                let options = pkr_driver::PurgeOptions {
                    tag,
                    except_tag,
                    repository,
                };
                commands::image::purge(&globals, &options).await
            }
        },

        Commands::Build(args) => build(&globals, args).await,
        Commands::Up(services) => commands::deploy::up(&globals, &services.into_list()).await,
        Commands::Start(services) => {
            commands::deploy::start(&globals, &services.into_list()).await
        }
        Commands::Down(services) | Commands::Stop(services) => {
            commands::deploy::down(&globals, &services.into_list()).await
        }
        Commands::Restart(services) => {
            commands::deploy::restart(&globals, &services.into_list()).await
        }
        Commands::Clean { kill } => commands::deploy::clean(&globals, kill).await,
        Commands::Ps => commands::deploy::ps(&globals).await,
        Commands::Listext { all } => commands::listext::run(&globals, all),
    }
}

async fn build(globals: &Globals, args: BuildArgs) -> Result<()> {
    let options = pkr_driver::BuildOptions {
        tag: args.tag,
        nocache: args.nocache,
        target: args.target,
        no_rebuild: args.no_rebuild,
        parallel: args.parallel,
        clean_builder: args.clean_builder,
    };
    commands::image::build(globals, &args.services.into_list(), &options).await
}

fn registry_options(args: RegistryArgs, other_tags: Vec<String>) -> pkr_driver::RegistryOptions {
    pkr_driver::RegistryOptions {
        registry: args.registry,
        username: args.username,
        password: args.password,
        tag: args.tag,
        other_tags,
        parallel: args.parallel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_services_positional_and_named() {
        let cli = Cli::try_parse_from(["pkr", "up", "api", "-s", "db", "cache"]).unwrap();
        match cli.command {
            Commands::Up(services) => assert_eq!(services.into_list(), vec!["api", "db", "cache"]),
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn test_verbosity_is_global() {
        let cli = Cli::try_parse_from(["pkr", "kard", "list", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_extra_takes_several_values() {
        let cli = Cli::try_parse_from([
            "pkr", "kard", "create", "demo", "-f", "git,auto_volume", "--extra", "tag=1", "a.b=c",
        ])
        .unwrap();
        match cli.command {
            Commands::Kard(KardCommand::Create {
                name,
                env,
                features,
                extra,
                ..
            }) => {
                assert_eq!(name, "demo");
                assert_eq!(env, "dev");
                assert_eq!(features.as_deref(), Some("git,auto_volume"));
                assert_eq!(extra, vec!["tag=1", "a.b=c"]);
            }
            _ => panic!("expected kard create"),
        }
    }
}
