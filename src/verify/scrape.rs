//! Lookup page strategy: the public report page, loaded through the challenge solver

use crate::error::CheckError;
use crate::pool::Worker;
use crate::proxy::models::VerificationRecord;
use crate::verify::solver::{SolverClient, SolverCommand};
use crate::verify::RunContext;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

static QUOTA_MARKER: Lazy<Selector> =
    Lazy::new(|| Selector::parse("span.label.label-danger").expect("Invalid quota selector"));

static REPORT_ROWS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table.ip-lookup-report tr").expect("Invalid report selector"));

static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("Invalid cell selector"));

static INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("Invalid integer regex"));

static DECIMAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("Invalid decimal regex"));

/// Text of a cell up to its first line break
fn first_line(cell: &ElementRef) -> String {
    let html = cell.inner_html();
    let head = html.split("<br").next().unwrap_or_default();
    Html::parse_fragment(head)
        .root_element()
        .text()
        .collect::<String>()
        .trim()
        .to_string()
}

/// Turn a lookup report page into a record.
///
/// Only the fields the page shows are filled; the rest stay unset.
pub fn parse_lookup_page(html: &str) -> Result<VerificationRecord, CheckError> {
    let document = Html::parse_document(html);

    if document.select(&QUOTA_MARKER).next().is_some() {
        return Err(CheckError::RateLimited);
    }

    let mut rows = document.select(&REPORT_ROWS).peekable();
    if rows.peek().is_none() {
        return Err(CheckError::malformed("lookup report table not found"));
    }

    let mut record = VerificationRecord::default();
    for row in rows {
        let cells: Vec<ElementRef> = row.select(&CELL).collect();
        if cells.len() < 2 {
            continue;
        }
        let key = first_line(&cells[0]);
        let value = first_line(&cells[1]);
        let value_opt = (!value.is_empty()).then(|| value.clone());

        match key.trim_end_matches(':').trim() {
            "Fraud Score" => {
                record.fraud_score = INTEGER
                    .find(&value)
                    .and_then(|m| m.as_str().parse().ok());
            }
            "Time Zone" => record.timezone = value_opt,
            "Organization" => record.organization = value_opt,
            "Hostname" => record.host = value_opt,
            "City" => record.city = value_opt,
            "Latitude" => record.latitude = parse_decimal(&value),
            "Longitude" => record.longitude = parse_decimal(&value),
            _ => {}
        }
    }

    Ok(record)
}

fn parse_decimal(value: &str) -> Option<f64> {
    DECIMAL.find(value).and_then(|m| m.as_str().parse().ok())
}

/// One lookup through the solver, via the run's current bypass proxy if it still works
async fn lookup(
    ctx: &RunContext,
    solver: &dyn SolverClient,
    egress: &str,
) -> Result<VerificationRecord, CheckError> {
    let url = format!("{}{}?{}", ctx.config.lookup_url, egress, Uuid::new_v4());

    let proxy = match ctx.run.current_bypass() {
        Some(bypass) => {
            let endpoint = bypass.endpoint();
            match ctx.probe.detect(&endpoint).await {
                Some(transport) => Some(endpoint.descriptor(transport.kind)),
                None => {
                    warn!(bypass = %bypass, "bypass proxy not reachable, looking up directly");
                    None
                }
            }
        }
        None => None,
    };

    let command = SolverCommand::get(url, &ctx.config.session_name, ctx.config.scrape_timeout, proxy);
    let response = solver.send(&command).await?;
    parse_lookup_page(response.page()?)
}

/// Worker loop for the scrape strategy.
///
/// A rate-limited lookup switches to the next reserve bypass proxy and retries
/// at once; other transient failures requeue the candidate and pause, anything
/// else drops it. Worker 0
/// tears the solver session down when it leaves the loop.
pub async fn scrape_worker(worker: Worker<RunContext>, solver: Arc<dyn SolverClient>) {
    let ctx = &worker.shared;

    while !worker.cancel.is_cancelled() {
        let Some(proxy) = ctx.run.dequeue() else {
            break;
        };
        let Some(egress) = proxy.real_address.clone() else {
            debug!(proxy = %proxy, "no egress address, skipping");
            ctx.run.drop_candidate(proxy);
            continue;
        };

        match lookup(ctx, solver.as_ref(), &egress).await {
            Ok(record) => ctx.record_outcome(record, &proxy).await,
            Err(CheckError::RateLimited) => match ctx.run.rotate_bypass(proxy) {
                Some(next) => {
                    info!(worker = worker.index, bypass = %next, "lookup quota hit, switched bypass proxy");
                }
                None => {
                    warn!(worker = worker.index, "lookup quota hit and no bypass proxies left, backing off");
                    if !ctx.pause(ctx.config.retry_delay).await {
                        break;
                    }
                }
            },
            Err(e) if e.is_transient() => {
                warn!(worker = worker.index, proxy = %proxy, "lookup failed: {}", e);
                ctx.run.requeue(proxy);
                if !ctx.pause(ctx.config.retry_delay).await {
                    break;
                }
            }
            Err(e) => {
                warn!(worker = worker.index, proxy = %proxy, "lookup failed for good: {}", e);
                ctx.run.drop_candidate(proxy);
            }
        }
    }

    if worker.index == 0 {
        if let Err(e) = solver.destroy_session(&ctx.config.session_name).await {
            debug!("failed to destroy solver session: {}", e);
        }
    }
    info!(worker = worker.index, "scrape worker finished");
}
