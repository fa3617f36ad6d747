use std::sync::Arc;

use anyhow::{Context, Result};
use applog_client::{snapshot, ClientConfig, HttpRecordSource, RecordSource};
use applog_core::{labeled_map, ApplicationPatch, ApplicationRecord, Category, NewApplication, Status};
use applog_engine::{
    daily_histogram, day_label, days_since, filter_and_sort, group_by_date, rollup, time_ago,
    timeline_summary, within_timeframe, CategoryFilter, SortKey, StatusFilter, Timeframe,
    ViewCriteria, DEFAULT_TREND_DAYS,
};
use applog_web::{AppState, WebConfig};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "applog")]
#[command(about = "ApplyLog job application tracker")]
struct Cli {
    /// Print the derived view as pretty JSON.
    #[arg(long, global = true)]
    json: bool,
    /// Reference instant (RFC 3339) for time-relative views.
    #[arg(long, global = true, value_parser = parse_now)]
    now: Option<DateTime<Utc>>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    List(ListArgs),
    Show {
        id: String,
    },
    Add(AddArgs),
    Update(UpdateArgs),
    Delete {
        id: String,
    },
    Stats {
        #[arg(long, default_value_t = Timeframe::All)]
        timeframe: Timeframe,
    },
    Timeline {
        #[arg(long, default_value = "all")]
        status: String,
        #[arg(long, default_value_t = Timeframe::All)]
        range: Timeframe,
    },
    Trend {
        #[arg(long, default_value_t = DEFAULT_TREND_DAYS)]
        days: usize,
    },
    Serve,
}

#[derive(Debug, Default, Args)]
struct ListArgs {
    #[arg(long, default_value = "")]
    search: String,
    #[arg(long, default_value = "all")]
    status: String,
    #[arg(long, default_value = "all")]
    category: String,
    #[arg(long, default_value_t = SortKey::DateDesc)]
    sort: SortKey,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    company: String,
    #[arg(long)]
    role: String,
    #[arg(long, default_value = "off_campus")]
    category: String,
    #[arg(long, default_value = "applied")]
    status: String,
    /// Defaults to today.
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    /// `LABEL=YYYY-MM-DD`, repeatable.
    #[arg(long = "important-date", value_parser = parse_pair)]
    important_dates: Vec<(String, String)>,
    /// `LABEL=URL`, repeatable.
    #[arg(long = "link", value_parser = parse_pair)]
    links: Vec<(String, String)>,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    id: String,
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    role: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long = "important-date", value_parser = parse_pair)]
    important_dates: Vec<(String, String)>,
    #[arg(long = "link", value_parser = parse_pair)]
    links: Vec<(String, String)>,
}

fn parse_now(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("expected an RFC 3339 timestamp: {err}"))
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    let (label, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected LABEL=VALUE, got `{raw}`"))?;
    Ok((label.to_string(), value.to_string()))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_row(record: &ApplicationRecord) {
    println!(
        "{:<26} {:<20} {:<24} {:<10} {:<10} {}",
        record.id,
        record.company_name,
        record.role,
        record.status.label(),
        record.category.label(),
        record.date_applied
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let now = cli.now.unwrap_or_else(Utc::now);

    let config = ClientConfig::from_env();
    let page_limit = config.page_limit;
    let source = HttpRecordSource::new(config).context("building record source client")?;

    match cli.command.unwrap_or_else(|| Commands::List(ListArgs::default())) {
        Commands::List(args) => {
            let records = snapshot(&source, page_limit).await?;
            let criteria = ViewCriteria {
                search: args.search,
                status: StatusFilter::from(args.status),
                category: CategoryFilter::from(args.category),
                sort: args.sort,
            };
            let view = filter_and_sort(&records, &criteria);
            if cli.json {
                return print_json(&view);
            }
            for record in &view {
                print_row(record);
            }
            println!("showing {} of {} applications", view.len(), records.len());
        }
        Commands::Show { id } => {
            let record = source.get(&id).await?;
            if cli.json {
                return print_json(&record);
            }
            print_row(&record);
            if let Some(day) = record.applied_on() {
                println!(
                    "applied {} ({} days ago)",
                    day_label(day, now),
                    days_since(day, now)
                );
            }
            if let Some(ts) = record.last_touched() {
                println!("updated {}", time_ago(ts, now));
            }
            for (label, value) in record.important_dates.iter().flatten() {
                println!("  date  {label}: {value}");
            }
            for (label, value) in record.links.iter().flatten() {
                println!("  link  {label}: {value}");
            }
            if let Some(notes) = &record.notes {
                println!("notes: {notes}");
            }
        }
        Commands::Add(args) => {
            let fields = NewApplication {
                company_name: args.company,
                role: args.role,
                category: Category::from(args.category),
                status: Status::from(args.status),
                date_applied: args.date.unwrap_or_default(),
                important_dates: labeled_map(args.important_dates),
                links: labeled_map(args.links),
                notes: args.notes,
            }
            .prepare(now.date_naive())?;
            let created = source.create(&fields).await?;
            info!(id = %created.id, "application created");
            if cli.json {
                return print_json(&created);
            }
            print_row(&created);
        }
        Commands::Update(args) => {
            let patch = ApplicationPatch {
                company_name: args.company,
                role: args.role,
                category: args.category.map(Category::from),
                status: args.status.map(Status::from),
                date_applied: args.date,
                important_dates: labeled_map(args.important_dates),
                links: labeled_map(args.links),
                notes: args.notes,
            }
            .normalized()?;
            let updated = source.update(&args.id, &patch).await?;
            if cli.json {
                return print_json(&updated);
            }
            print_row(&updated);
        }
        Commands::Delete { id } => {
            source.delete(&id).await?;
            info!(%id, "application deleted");
            if cli.json {
                return print_json(&serde_json::json!({ "deleted": id }));
            }
            println!("deleted {id}");
        }
        Commands::Stats { timeframe } => {
            let records = snapshot(&source, page_limit).await?;
            let summary = rollup(within_timeframe(&records, timeframe, now));
            if cli.json {
                return print_json(&summary);
            }
            println!("{} applications ({timeframe})", summary.total);
            for (status, count) in &summary.counts_by_status {
                let share = summary.share_of(&Status::from(status.as_str()));
                println!("  {:<12} {count:>5} {share:>4}%", Status::from(status.as_str()).label());
            }
            for (category, count) in &summary.counts_by_category {
                println!("  {:<12} {count:>5}", Category::from(category.as_str()).label());
            }
            println!(
                "response {}%  success {}%  rejection {}%",
                summary.response_rate, summary.success_rate, summary.rejection_rate
            );
        }
        Commands::Timeline { status, range } => {
            let records = snapshot(&source, page_limit).await?;
            let status = StatusFilter::from(status);
            let by_status = records.iter().filter(|r| status.admits(&r.status));
            let windowed = within_timeframe(by_status, range, now);
            let summary = timeline_summary(windowed.iter().copied());
            let groups = group_by_date(windowed);
            if cli.json {
                return print_json(&serde_json::json!({ "summary": summary, "groups": groups }));
            }
            println!(
                "{} applications, {} interviews, {} offers",
                summary.total, summary.interviews, summary.offers
            );
            for bucket in &groups {
                let heading = applog_core::parse_calendar_day(bucket.date)
                    .map(|day| day_label(day, now))
                    .unwrap_or_else(|| bucket.date.to_string());
                println!("{heading}");
                for record in &bucket.applications {
                    print_row(record);
                }
            }
        }
        Commands::Trend { days } => {
            let records = snapshot(&source, page_limit).await?;
            let trend = daily_histogram(&records, now, days);
            if cli.json {
                return print_json(&trend);
            }
            for day in &trend {
                println!("{} {:>3} {}", day.date, day.count, "#".repeat(day.count));
            }
        }
        Commands::Serve => {
            let mut state = AppState::new(Arc::new(source)).with_snapshot_limit(page_limit);
            if let Some(fixed) = cli.now {
                state = state.with_fixed_now(fixed);
            }
            applog_web::serve(WebConfig::from_env(), state).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_split_on_first_equals() {
        assert_eq!(
            parse_pair("offer deadline=2024-04-01").unwrap(),
            ("offer deadline".to_string(), "2024-04-01".to_string())
        );
        assert_eq!(
            parse_pair("portal=https://x.test/?a=b").unwrap().1,
            "https://x.test/?a=b"
        );
        assert!(parse_pair("no separator").is_err());
    }

    #[test]
    fn now_accepts_rfc3339_offsets() {
        let ts = parse_now("2024-03-10T17:30:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-10T15:30:00+00:00");
        assert!(parse_now("2024-03-10").is_err());
    }

    #[test]
    fn list_flags_parse_into_criteria_parts() {
        let cli = Cli::try_parse_from([
            "applog", "--json", "list", "--status", "offer", "--sort", "company",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Some(Commands::List(args)) => {
                assert_eq!(args.sort, SortKey::Company);
                assert_eq!(StatusFilter::from(args.status), StatusFilter::Only(Status::Offer));
                assert_eq!(CategoryFilter::from(args.category), CategoryFilter::All);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["applog", "list", "--sort", "salary"]).is_err());
        assert!(Cli::try_parse_from(["applog", "stats", "--timeframe", "14d"]).is_err());
    }

    #[test]
    fn add_collects_repeated_pairs() {
        let cli = Cli::try_parse_from([
            "applog",
            "add",
            "--company",
            "Acme",
            "--role",
            "SRE",
            "--important-date",
            "onsite=2024-03-20",
            "--link",
            "portal=https://acme.test",
            "--link",
            "referral=https://ref.test",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Add(args)) => {
                assert_eq!(args.status, "applied");
                assert_eq!(args.important_dates.len(), 1);
                assert_eq!(labeled_map(args.links).map(|m| m.len()), Some(2));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
