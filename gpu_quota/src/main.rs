use std::env;
use std::process::ExitCode;

use chrono::{Local, NaiveDate};
use clap::Parser as _;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use gpu_quota_data::access::{self, AccessRequest, Caller};
use gpu_quota_data::report::{self, DateRange, ReportOutcome, ReportParams};
use gpu_quota_data::slurm::{self, SlurmCli, SlurmUser};
use gpu_quota_data::render;
use tracing::{debug, info, Level};

mod cli;
mod config;

use cli::Args;
use config::Settings;

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let args = Args::parse();
    register_logging(args.log_level)?;

    let settings = read_config(&args)?;
    debug!(?settings, "loaded configuration");

    let today = Local::now().date_naive();
    let range = report_range(args.start, args.end, today)?;

    let caller = Caller::new(current_user()?, &settings.superuser);
    let request = AccessRequest {
        username: args.username().map(SlurmUser::from),
        account: args.account.clone(),
    };
    let access = match access::resolve(&caller, request, |account| slurm::coordinators(&SlurmCli, account)) {
        Ok(access) => access,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    if !caller.privileged {
        notice(&args, format_args!("Using current user: {}", caller.identity));
    } else if let (None, Some(account)) = (&access.username, &access.account) {
        notice(
            &args,
            format_args!("Warning: No username specified. Reporting all users in account {account}."),
        );
    }
    if range.ends_on(today) {
        notice(
            &args,
            format_args!("Warning: The report ends today. Jobs from the last few minutes may be missing due to accounting delays."),
        );
    }

    let params = ReportParams {
        range,
        accounting_lag: *settings.accounting_lag,
        qos: settings.qos,
        mode: args.mode.unwrap_or(settings.mode),
        costs: settings.cost_per_gpu_minute,
    };
    match report::generate(&SlurmCli, &access, &params)? {
        ReportOutcome::NoUsage => notice(&args, format_args!("No GPU usage data found for the specified criteria.")),
        ReportOutcome::Ready(report) if args.json => println!("{}", render::json(&report)?),
        ReportOutcome::Ready(report) => print!("{}", render::text(&report)),
    }

    Ok(ExitCode::SUCCESS)
}

/// Missing bounds default to the month the report ends in, up to today.
fn report_range(start: Option<NaiveDate>, end: Option<NaiveDate>, today: NaiveDate) -> Result<DateRange> {
    let end = end.unwrap_or(today);
    DateRange::new(start.unwrap_or(DateRange::month_to_date(end).start), end)
}

fn register_logging(level: Level) -> Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        // stdout is reserved for the report
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")
}

fn read_config(args: &Args) -> Result<Settings> {
    info!("Loading config");
    Settings::new(args.config.as_deref()).context("parsing config file")
}

fn current_user() -> Result<SlurmUser> {
    let user = env::var("USER").context("determining the current user from $USER")?;
    Ok(SlurmUser(user))
}

/// Informational line for the person at the terminal. Goes to stderr with `--json`.
fn notice(args: &Args, message: std::fmt::Arguments<'_>) {
    if args.json {
        eprintln!("{message}");
    } else {
        println!("{message}");
    }
}
