// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apple_release::{
        config::{BuildProfile, ConfigFile, PipelineConfigBuilder},
        error::AppleReleaseError,
        pipeline::{Pipeline, Toolchain},
    },
    clap::{Arg, ArgMatches, Command},
    log::{warn, LevelFilter},
    std::{path::Path, time::Duration},
};

const ABOUT: &str = "\
Sign, package, notarize and staple macOS application bundles.

The unsigned bundle produced by the build for each architecture is signed
inside-out with the configured Developer ID identity, verified, wrapped in a
signed disk image, submitted to Apple's notary service and stapled.

When no usable signing identity is available the bundle is ad-hoc signed
and packaged but not notarized. Such output only runs on this machine.
When notarization credentials are incomplete, notarization is skipped.

Settings are read from (in increasing order of precedence) the file given
by --config, APPLE_RELEASE_* and APPLE_NOTARIZATION_* environment variables
and command line arguments.
";

/// Build a configuration from a config file, the environment and arguments.
fn config_from_args(args: &ArgMatches) -> Result<PipelineConfigBuilder, AppleReleaseError> {
    let mut builder = PipelineConfigBuilder::new();

    if let Some(path) = args.value_of("config") {
        warn!("reading configuration from {}", path);
        builder.apply_file(ConfigFile::from_path(Path::new(path))?);
    }

    builder.apply_process_environment();

    if args.is_present("debug") {
        builder.profile(BuildProfile::Debug);
    } else if args.is_present("release") {
        builder.profile(BuildProfile::Release);
    }

    if let Some(value) = args.value_of("identity") {
        builder.identity(value);
    }
    if let Some(value) = args.value_of("team_id") {
        builder.team_id(value);
    }
    if let Some(value) = args.value_of("keychain") {
        builder.keychain(value);
    }
    if let Some(value) = args.value_of("app_name") {
        builder.app_name(value);
    }
    if let Some(value) = args.value_of("bundle_name") {
        builder.bundle_name(value);
    }
    if let Some(value) = args.value_of("target_dir") {
        builder.target_dir(value);
    }
    if let Some(value) = args.value_of("bundle") {
        builder.bundle_path(value);
    }
    if let Some(value) = args.value_of("entitlements") {
        builder.entitlements(value);
    }
    if let Some(value) = args.value_of("poll_interval_seconds") {
        let seconds = value.parse::<u64>().map_err(|_| {
            AppleReleaseError::CliBadArgument(format!(
                "--poll-interval-seconds must be a positive integer; got {}",
                value
            ))
        })?;
        builder.poll_interval(Duration::from_secs(seconds));
    }

    builder
        .local(args.is_present("local_arch"))
        .open(args.is_present("open"))
        .install(args.is_present("install"));

    Ok(builder)
}

fn main_impl() -> Result<i32, AppleReleaseError> {
    let app = Command::new("apple-release")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Sign, notarize and package macOS application bundles")
        .long_about(ABOUT)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .conflicts_with("release")
                .help("Release the output of a debug build"),
        )
        .arg(
            Arg::new("release")
                .long("release")
                .help("Release the output of a release build (the default)"),
        )
        .arg(
            Arg::new("local_arch")
                .long("local-arch")
                .help("Only process the architecture of this machine"),
        )
        .arg(
            Arg::new("open")
                .long("open")
                .help("Open the disk image (or the bundle with --local-arch) when done"),
        )
        .arg(
            Arg::new("install")
                .long("install")
                .requires("local_arch")
                .help("Copy the signed bundle into /Applications"),
        )
        .arg(
            Arg::new("app_name")
                .long("app-name")
                .takes_value(true)
                .help("Name of the application bundle produced by the build, without .app"),
        )
        .arg(
            Arg::new("bundle_name")
                .long("bundle-name")
                .takes_value(true)
                .help("Rename the bundle to <NAME>.app before signing"),
        )
        .arg(
            Arg::new("target_dir")
                .long("target-dir")
                .takes_value(true)
                .help("Build output directory containing per-target bundles"),
        )
        .arg(
            Arg::new("bundle")
                .long("bundle")
                .takes_value(true)
                .conflicts_with("app_name")
                .help("Path to an unsigned bundle to release instead of the build output"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .takes_value(true)
                .help("Path to a YAML configuration file"),
        )
        .arg(
            Arg::new("identity")
                .long("identity")
                .takes_value(true)
                .help("Signing identity name, substring of it, or SHA-1 fingerprint"),
        )
        .arg(
            Arg::new("team_id")
                .long("team-id")
                .takes_value(true)
                .help("Team identifier the signing identity is expected to belong to"),
        )
        .arg(
            Arg::new("keychain")
                .long("keychain")
                .takes_value(true)
                .help("Keychain file to search for the signing identity"),
        )
        .arg(
            Arg::new("entitlements")
                .long("entitlements")
                .takes_value(true)
                .help("Entitlements plist for the main executable and bundle"),
        )
        .arg(
            Arg::new("poll_interval_seconds")
                .long("poll-interval-seconds")
                .takes_value(true)
                .help("Seconds between notarization status queries"),
        );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    let config = config_from_args(&matches)?.build()?;
    let toolchain = Toolchain::system(&config)?;
    let pipeline = Pipeline::new(config, toolchain);

    let abort = pipeline.abort_signal();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("interrupted; aborting after the current step");
        abort.abort();
    }) {
        warn!("unable to install interrupt handler: {}", e);
    }

    let summary = pipeline.run()?;
    summary.log();

    Ok(summary.exit_code())
}

fn main() {
    let exit_code = match main_impl() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
