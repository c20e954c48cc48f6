//! squashrun - HPC container launcher CLI
//!
//! ## Usage
//!
//! ```sh
//! squashrun [FLAGS] <image-ref> [cmd args...]
//! ```
//!
//! Prepares an OCI bundle from a locally available squashfs image and runs
//! it through the configured OCI runtime. The image must have been pulled
//! beforehand by the image-manager pipeline.
//!
//! ## Exit Codes
//!
//! - `0` on success
//! - the OCI runtime's own exit code when the container fails
//! - `1` for setup errors before the runtime is forked

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use squashrun::config::{
    installation_prefix, AdminConfig, CommandRun, Config, Directories, UserIdentity,
};
use squashrun::constants::ADMIN_CONFIG_RELATIVE_PATH;
use squashrun::error::{Context, ErrorKind, Result};
use squashrun::image::ImageReference;
use squashrun::mount::MountDescriptor;
use squashrun::request::{parse_device_request, parse_mount_request};
use squashrun::runtime::Runtime;

const USAGE: &str = "\
Usage: squashrun [FLAGS] <image-ref> [cmd args...]

Run a container from an image in the local repository.

Flags:
  --mount=SRC[:DST[:OPTS]]    bind mount a host path (repeatable);
                              OPTS: bind, ro, rw
  --device=HOST[:CONT[:ACC]]  mount a host device (repeatable);
                              ACC: combination of r, w, m (default rwm)
  --entrypoint=STR            override the image entrypoint
  --workdir=DIR               override the container working directory
  --init                      run an init process inside the container
  --mpi                       activate the site MPI hook
  --ssh                       activate the site SSH hook
  --centralized-repository    use the centralized image repository
  --temp-dir=DIR              override the configured scratch directory
  --debug                     enable debug logging
  --help                      print this help
  --version                   print the version";

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Default)]
struct CliRequest {
    mounts: Vec<String>,
    devices: Vec<String>,
    entrypoint: Option<String>,
    workdir: Option<PathBuf>,
    init: bool,
    mpi: bool,
    ssh: bool,
    centralized_repository: bool,
    temp_dir: Option<PathBuf>,
    debug: bool,
    image: String,
    container_args: Vec<String>,
}

enum ParsedCommand {
    Run(CliRequest),
    Help,
    Version,
}

fn parse_args(args: Vec<String>) -> std::result::Result<ParsedCommand, String> {
    let mut request = CliRequest::default();
    let mut iter = args.into_iter().peekable();

    while let Some(arg) = iter.peek() {
        if !arg.starts_with("--") {
            break;
        }
        let arg = iter.next().expect("peeked");
        if arg == "--" {
            break;
        }

        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };

        // Valued flags accept both `--flag=value` and `--flag value`.
        let take_value = |iter: &mut std::iter::Peekable<std::vec::IntoIter<String>>|
            -> std::result::Result<String, String> {
            if let Some(value) = inline_value.clone() {
                return Ok(value);
            }
            iter.next().ok_or(format!("{flag} requires a value"))
        };

        match flag.as_str() {
            "--mount" => request.mounts.push(take_value(&mut iter)?),
            "--device" => request.devices.push(take_value(&mut iter)?),
            "--entrypoint" => request.entrypoint = Some(take_value(&mut iter)?),
            "--workdir" => request.workdir = Some(PathBuf::from(take_value(&mut iter)?)),
            "--temp-dir" => request.temp_dir = Some(PathBuf::from(take_value(&mut iter)?)),
            "--init" => request.init = true,
            "--mpi" => request.mpi = true,
            "--ssh" => request.ssh = true,
            "--centralized-repository" => request.centralized_repository = true,
            "--debug" => request.debug = true,
            "--help" => return Ok(ParsedCommand::Help),
            "--version" => return Ok(ParsedCommand::Version),
            unknown => return Err(format!("unknown flag: {unknown}")),
        }
    }

    match iter.next() {
        Some(image) => request.image = image,
        None => return Err("missing <image-ref> argument".to_string()),
    }
    request.container_args = iter.collect();

    Ok(ParsedCommand::Run(request))
}

// =============================================================================
// Entry Point
// =============================================================================

fn main() -> ExitCode {
    let command = match parse_args(std::env::args().skip(1).collect()) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("squashrun: {message}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    let request = match command {
        ParsedCommand::Help => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        ParsedCommand::Version => {
            println!("squashrun {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        ParsedCommand::Run(request) => request,
    };

    init_logging(request.debug);

    match run(request) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let ErrorKind::RuntimeFailure(status) = err.kind() {
                // Not a launcher error: the container ran and failed, and
                // its status becomes ours, unwrapped.
                std::process::exit(*status);
            }
            error!("{err}");
            info!("error trace:\n{}", err.format_trace());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(request: CliRequest) -> Result<()> {
    let prefix = installation_prefix()?;
    let admin = AdminConfig::load(&prefix.join(ADMIN_CONFIG_RELATIVE_PATH))?;
    let user_identity = UserIdentity::current()?;
    let directories = Directories::initialize(
        request.centralized_repository,
        &admin,
        &user_identity,
        request.temp_dir.clone(),
    )?;
    let image_reference = ImageReference::parse(&request.image)?;
    let command_run = build_command_run(&admin, &request)?;

    let config = Config {
        admin,
        user_identity,
        image_reference,
        directories,
        command_run,
    };

    let mut runtime = Runtime::new(config)?;
    runtime.setup_bundle()?;
    runtime.execute_container()
}

fn build_command_run(admin: &AdminConfig, request: &CliRequest) -> Result<CommandRun> {
    // Site mounts first: user mounts may deliberately shadow them.
    let mut mounts = Vec::with_capacity(admin.site_mounts.len() + request.mounts.len());
    for site_mount in &admin.site_mounts {
        mounts.push(MountDescriptor::Bind(
            parse_mount_request(site_mount)
                .context("invalid site mount in the admin configuration")?,
        ));
    }
    for user_mount in &request.mounts {
        mounts.push(MountDescriptor::Bind(parse_mount_request(user_mount)?));
    }

    let mut device_mounts = Vec::with_capacity(request.devices.len());
    for device in &request.devices {
        device_mounts.push(parse_device_request(device)?);
    }

    let entrypoint = request
        .entrypoint
        .as_ref()
        .map(|e| e.split_whitespace().map(str::to_string).collect());

    Ok(CommandRun {
        host_environment: std::env::vars().collect::<HashMap<_, _>>(),
        exec_args: request.container_args.clone(),
        entrypoint,
        workdir: request.workdir.clone(),
        mounts,
        device_mounts,
        hooks_environment: HashMap::new(),
        use_mpi: request.mpi,
        enable_ssh: request.ssh,
        add_init_process: request.init,
        cpu_affinity: Vec::new(),
    })
}
