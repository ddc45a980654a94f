use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SubsecRound, Utc};
use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, Color, ColorChoice, Style, Table, TableStruct, print_stdout};
use humantime::format_duration;

use crate::common::cli::OutputMode;
use crate::controller::registry::WorkerState;
use crate::controller::scaling::ScalingDecision;
use crate::controller::status::{ControllerState, ControllerStatus};

const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Downloads the current status of the controller listening on `address`.
pub async fn fetch_status(address: SocketAddr) -> anyhow::Result<ControllerStatus> {
    let client = reqwest::Client::builder()
        .timeout(STATUS_REQUEST_TIMEOUT)
        .build()?;
    let status = client
        .get(format!("http://{address}/status"))
        .send()
        .await
        .with_context(|| format!("Cannot connect to controller at {address}"))?
        .error_for_status()?
        .json()
        .await
        .context("Cannot parse controller status")?;
    Ok(status)
}

pub fn print_status(status: &ControllerStatus, mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(status)?);
        }
        OutputMode::Table => {
            print_table(summary_table(status, Utc::now()));
            if !status.workers.is_empty() {
                println!();
                print_table(worker_table(status));
            }
        }
    }
    Ok(())
}

fn print_table(table: TableStruct) {
    let table = table.color_choice(ColorChoice::Auto);
    if let Err(e) = print_stdout(table) {
        log::error!("Cannot print table to stdout: {e:?}");
    }
}

fn summary_table(status: &ControllerStatus, now: DateTime<Utc>) -> TableStruct {
    let uptime = (now - status.started_at).to_std().unwrap_or_default();
    let rows = vec![
        vec!["Name".cell().bold(true), status.name.as_str().cell()],
        vec![
            "Version".cell().bold(true),
            status.version.as_str().cell(),
        ],
        vec!["State".cell().bold(true), state_cell(status.state)],
        vec![
            "Uptime".cell().bold(true),
            format_duration(Duration::from_secs(uptime.as_secs()))
                .to_string()
                .cell(),
        ],
        vec!["Cycles".cell().bold(true), status.cycles.cell()],
        vec![
            "Fleet".cell().bold(true),
            format!(
                "{} running / {} total / {} max",
                status.workers.iter().filter(|w| w.is_running()).count(),
                status.workers.len(),
                status.max_fleet_size
            )
            .cell(),
        ],
        vec![
            "Jobs".cell().bold(true),
            format!(
                "{} received, {} completed, {} failed, {} unroutable",
                status.jobs.received,
                status.jobs.completed,
                status.jobs.failed,
                status.jobs.unroutable
            )
            .cell(),
        ],
        vec![
            "Last scaling".cell().bold(true),
            status
                .last_scaling
                .as_ref()
                .map(|event| {
                    format!(
                        "{} at {}",
                        format_decision(event.outcome.decision),
                        event.at.round_subsecs(0)
                    )
                })
                .unwrap_or_else(|| "None".to_string())
                .cell(),
        ],
        vec![
            "Last result".cell().bold(true),
            status
                .last_result
                .as_ref()
                .map(|result| format!("{}: {}", result.output_key, result.prediction))
                .unwrap_or_else(|| "None".to_string())
                .cell(),
        ],
        vec![
            "Last error".cell().bold(true),
            match &status.last_error {
                Some(error) => format!("{} ({})", error.message, error.at.round_subsecs(0))
                    .cell()
                    .foreground_color(Some(Color::Red)),
                None => "None".cell(),
            },
        ],
    ];
    rows.table().separator(
        Separator::builder()
            .column(Some(Default::default()))
            .build(),
    )
}

fn worker_table(status: &ControllerStatus) -> TableStruct {
    let rows: Vec<Vec<CellStruct>> = status
        .workers
        .iter()
        .map(|worker| {
            vec![
                worker.instance_id.as_str().cell(),
                match worker.state {
                    WorkerState::Provisioning => {
                        "PROVISIONING".cell().foreground_color(Some(Color::Yellow))
                    }
                    WorkerState::Running => "RUNNING".cell().foreground_color(Some(Color::Green)),
                    WorkerState::Terminating => {
                        "TERMINATING".cell().foreground_color(Some(Color::Magenta))
                    }
                },
                worker
                    .public_ip()
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "N/A".to_string())
                    .cell()
                    .justify(Justify::Right),
                worker.added_at.round_subsecs(0).to_string().cell(),
            ]
        })
        .collect();
    let header = vec![
        "Instance".cell().bold(true),
        "State".cell().bold(true),
        "Address".cell().bold(true),
        "Added".cell().bold(true),
    ];
    rows.table()
        .separator(
            Separator::builder()
                .title(Some(Default::default()))
                .column(Some(Default::default()))
                .build(),
        )
        .title(header)
}

fn state_cell(state: ControllerState) -> CellStruct {
    match state {
        ControllerState::Starting => "STARTING".cell().foreground_color(Some(Color::Cyan)),
        ControllerState::Running => "RUNNING".cell().foreground_color(Some(Color::Green)),
        ControllerState::Stopping => "STOPPING".cell().foreground_color(Some(Color::Yellow)),
        ControllerState::Stopped => "STOPPED".cell().foreground_color(Some(Color::Red)),
    }
}

fn format_decision(decision: ScalingDecision) -> String {
    match decision {
        ScalingDecision::None => "none".to_string(),
        ScalingDecision::ScaleUp(count) => format!("scale up by {count}"),
        ScalingDecision::ScaleDown(count) => format!("scale down by {count}"),
    }
}
