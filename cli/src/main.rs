/*!

This is the command line interface for the kapparmor end-to-end tests. It prepares the local
MicroK8s host, deploys the controller and runs the selected scenarios against it.

!*/

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use e2e_harness::cluster::KubeCluster;
use e2e_harness::deploy::{DeployRequest, Deployer, Provenance};
use e2e_harness::exec::SystemRunner;
use e2e_harness::prepare::EnvironmentPreparer;
use e2e_harness::run_log::{self, section};
use e2e_harness::suite::{Selection, Tally, TestSuite};
use e2e_model::constants::{CONFIG_FILE, LOG_DIR, SECRETS_FILE};
use e2e_model::settings::read_shell_config;
use e2e_model::{EnvSettings, Settings};
use log::{error, info, warn, LevelFilter};
use std::path::{Path, PathBuf};

/// Runs the kapparmor end-to-end tests on a MicroK8s host.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// Set logging verbosity [trace|debug|info|warn|error]. If the environment variable `RUST_LOG`
    /// is present, it overrides the default logging behavior. See https://docs.rs/env_logger/latest
    #[clap(long = "log-level", default_value = "info")]
    log_level: LevelFilter,
    /// Path to the kubeconfig file. Without it the default kubeconfig is used, else the output of
    /// `microk8s config`.
    #[clap(long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,
    /// The namespace the controller is deployed to. Overrides `TARGET_NS`.
    #[clap(long = "target-ns")]
    target_ns: Option<String>,
    /// The namespace for test workloads. Overrides `TEST_NS`.
    #[clap(long = "test-ns")]
    test_ns: Option<String>,
    /// Path to the kapparmor Helm chart.
    #[clap(long = "chart")]
    chart: Option<PathBuf>,
    /// Do not build the controller image.
    #[clap(long = "skip-build")]
    skip_build: bool,
    /// Build the image locally and import it into MicroK8s instead of pulling it.
    #[clap(long = "sideload")]
    sideload: bool,
    /// The scenarios to run [all|case1|case2|case3].
    #[clap(long = "run", default_value = "all")]
    run: Selection,
    /// Where to write the run log. Defaults to `output/e2e_test_<timestamp>.log`.
    #[clap(long = "log-file")]
    log_file: Option<PathBuf>,
    /// A shell style `KEY=VALUE` file read on top of the environment.
    #[clap(long = "config-file", default_value = CONFIG_FILE)]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_file = args
        .log_file
        .clone()
        .unwrap_or_else(|| run_log::default_log_path(Path::new(LOG_DIR), Utc::now()));
    if let Err(e) = run_log::init(args.log_level, &log_file) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let code = tokio::select! {
        result = run(args, &log_file) => match result {
            Ok(tally) => tally.exit_code(),
            Err(e) => {
                error!("Fatal error: {:?}", e);
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted by user");
            130
        }
    };
    std::process::exit(code);
}

async fn run(args: Args, log_file: &Path) -> Result<Tally> {
    let settings = load_settings(&args)?;
    let runner = SystemRunner::new(settings.timeouts.command);

    section("Kapparmor E2E Tests");
    info!("Start time: {}", Utc::now());
    let provenance = Provenance::capture(&runner, Utc::now()).await;
    info!("Git commit: {}", provenance.git_sha);
    info!("Build time: {}", provenance.build_time);
    info!("Log file: {}", log_file.display());

    let cluster = KubeCluster::from_settings(&settings, &runner)
        .await
        .context("Unable to create the Kubernetes client")?;
    EnvironmentPreparer::new(&settings, &runner, &cluster)
        .prepare()
        .await
        .context("The MicroK8s host could not be prepared")?;

    let request = DeployRequest {
        version: settings.app_version.clone(),
        chart: settings.chart.clone(),
        namespace: settings.target_namespace.clone(),
        sideload: args.sideload,
        skip_build: args.skip_build,
        provenance,
    };
    Deployer::new(&settings, &runner, &cluster)
        .deploy(&request)
        .await
        .context("Unable to deploy the controller")?;

    Ok(TestSuite::new(&settings, &cluster).run(args.run).await)
}

/// Builds the run settings. Later sources win: the environment, the config file, the secrets
/// file in the home directory and finally the command line.
fn load_settings(args: &Args) -> Result<Settings> {
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.extend(read_shell_config(&args.config_file).context(format!(
        "Unable to read config file '{}'",
        args.config_file.display()
    ))?);
    if let Some(home) = std::env::var_os("HOME") {
        let secrets = PathBuf::from(home).join(SECRETS_FILE);
        vars.extend(
            read_shell_config(&secrets)
                .context(format!("Unable to read '{}'", secrets.display()))?,
        );
    }
    let env = EnvSettings::from_vars(vars).context("Invalid settings")?;
    let settings = Settings::from_env_settings(env).context("Invalid settings")?;
    Ok(apply_args(settings, args))
}

fn apply_args(mut settings: Settings, args: &Args) -> Settings {
    if let Some(namespace) = &args.target_ns {
        settings.target_namespace = namespace.clone();
    }
    if let Some(namespace) = &args.test_ns {
        settings.test_namespace = namespace.clone();
    }
    if let Some(chart) = &args.chart {
        settings.chart = chart.clone();
    }
    if let Some(kubeconfig) = &args.kubeconfig {
        settings.kubeconfig = Some(kubeconfig.clone());
    }
    settings
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["kapparmor-e2e"]).unwrap();
        assert_eq!(args.run, Selection::All);
        assert_eq!(args.log_level, LevelFilter::Info);
        assert!(!args.sideload);
        assert_eq!(args.config_file, PathBuf::from(CONFIG_FILE));
        assert_eq!(apply_args(Settings::default(), &args), Settings::default());
    }

    #[test]
    fn flags_override_settings() {
        let args = Args::try_parse_from([
            "kapparmor-e2e",
            "--target-ns",
            "kapparmor-system",
            "--chart",
            "/src/kapparmor/charts/kapparmor",
            "--sideload",
            "--skip-build",
            "--run",
            "case3",
        ])
        .unwrap();
        assert_eq!(args.run, Selection::Case3);
        assert!(args.sideload && args.skip_build);
        let settings = apply_args(Settings::default(), &args);
        assert_eq!(settings.target_namespace, "kapparmor-system");
        assert_eq!(
            settings.chart,
            PathBuf::from("/src/kapparmor/charts/kapparmor")
        );
        assert_eq!(settings.test_namespace, Settings::default().test_namespace);
    }

    #[test]
    fn unknown_selection_is_rejected() {
        assert!(Args::try_parse_from(["kapparmor-e2e", "--run", "case9"]).is_err());
    }
}
