//! Task-file persistence: flat `KEY=VALUE` lines, rewritten in full on
//! every add/remove and reloaded at startup.
//!
//! Format:
//!
//! ```text
//! TASKS_COUNT=2
//! TASK_0_NAME=update-binance
//! TASK_0_TYPE=update
//! TASK_0_ENABLED=true
//! TASK_0_INTERVAL_VALUE=30
//! TASK_0_INTERVAL_UNIT=minutes
//! TASK_0_EXCHANGE=binance
//! TASK_0_NEXT_SCHEDULED_AT=2024-03-10T09:30:00Z
//! TASK_1_NAME=new-cycles
//! TASK_1_TYPE=new
//! TASK_1_ENABLED=true
//! TASK_1_SPECIFIC_TIME=09:00
//! TASK_1_NEXT_SCHEDULED_AT=2024-03-11T09:00:00Z
//! ```
//!
//! Optional fields are omitted when absent; every field present must
//! round-trip losslessly.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::domain::{parse_specific_time, IntervalUnit, ScheduledTask, TaskKind};
use crate::error::{CyclerError, Result};
use crate::exchange::Exchange;

pub fn serialize_tasks(tasks: &[ScheduledTask]) -> String {
    let mut out = String::new();
    out.push_str(&format!("TASKS_COUNT={}\n", tasks.len()));

    for (i, task) in tasks.iter().enumerate() {
        let mut push = |field: &str, value: String| {
            out.push_str(&format!("TASK_{i}_{field}={value}\n"));
        };
        push("NAME", task.name.clone());
        push("TYPE", task.kind.to_string());
        push("ENABLED", task.enabled.to_string());
        if let Some(value) = task.interval_value {
            push("INTERVAL_VALUE", value.to_string());
        }
        if let Some(unit) = task.interval_unit {
            push("INTERVAL_UNIT", unit.to_string());
        }
        if let Some(at) = task.specific_time {
            push("SPECIFIC_TIME", at.format("%H:%M").to_string());
        }
        if let Some(exchange) = task.exchange {
            push("EXCHANGE", exchange.to_string());
        }
        if let Some(offset) = task.buy_offset {
            push("BUY_OFFSET", offset.normalize().to_string());
        }
        if let Some(offset) = task.sell_offset {
            push("SELL_OFFSET", offset.normalize().to_string());
        }
        if let Some(percent) = task.percent {
            push("PERCENT", percent.normalize().to_string());
        }
        if let Some(next) = task.next_scheduled_at {
            push(
                "NEXT_SCHEDULED_AT",
                next.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
    }
    out
}

pub fn parse_tasks(text: &str) -> Result<Vec<ScheduledTask>> {
    let mut pairs: HashMap<String, String> = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(CyclerError::Task(format!(
                "malformed task file line: '{line}'"
            )));
        };
        pairs.insert(key.trim().to_string(), value.trim().to_string());
    }

    let count: usize = pairs
        .get("TASKS_COUNT")
        .ok_or_else(|| CyclerError::Task("task file missing TASKS_COUNT".to_string()))?
        .parse()
        .map_err(|e| CyclerError::Task(format!("invalid TASKS_COUNT: {e}")))?;

    let mut tasks = Vec::with_capacity(count);
    for i in 0..count {
        let get = |field: &str| pairs.get(&format!("TASK_{i}_{field}")).cloned();
        let require = |field: &str| {
            get(field).ok_or_else(|| {
                CyclerError::Task(format!("task {i} is missing TASK_{i}_{field}"))
            })
        };

        let name = require("NAME")?;
        let kind = TaskKind::from_str(&require("TYPE")?)
            .map_err(|e| CyclerError::Task(format!("task {i}: {e}")))?;
        let enabled = require("ENABLED")?
            .parse::<bool>()
            .map_err(|e| CyclerError::Task(format!("task {i} ENABLED: {e}")))?;

        let interval_value = get("INTERVAL_VALUE")
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|e| CyclerError::Task(format!("task {i} INTERVAL_VALUE: {e}")))
            })
            .transpose()?;
        let interval_unit = get("INTERVAL_UNIT")
            .map(|v| {
                IntervalUnit::from_str(&v)
                    .map_err(|e| CyclerError::Task(format!("task {i}: {e}")))
            })
            .transpose()?;
        let specific_time = get("SPECIFIC_TIME")
            .map(|v| parse_specific_time(&v).map_err(CyclerError::Task))
            .transpose()?;
        let exchange = get("EXCHANGE")
            .map(|v| {
                Exchange::from_str(&v)
                    .map_err(|e| CyclerError::Task(format!("task {i}: {e}")))
            })
            .transpose()?;

        let parse_decimal = |field: &str| -> Result<Option<Decimal>> {
            get(field)
                .map(|v| {
                    Decimal::from_str(&v)
                        .map_err(|e| CyclerError::Task(format!("task {i} {field}: {e}")))
                })
                .transpose()
        };
        let buy_offset = parse_decimal("BUY_OFFSET")?;
        let sell_offset = parse_decimal("SELL_OFFSET")?;
        let percent = parse_decimal("PERCENT")?;

        let next_scheduled_at = get("NEXT_SCHEDULED_AT")
            .map(|v| {
                DateTime::parse_from_rfc3339(&v)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| CyclerError::Task(format!("task {i} NEXT_SCHEDULED_AT: {e}")))
            })
            .transpose()?;

        let task = ScheduledTask {
            name,
            kind,
            enabled,
            interval_value,
            interval_unit,
            specific_time,
            exchange,
            buy_offset,
            sell_offset,
            percent,
            last_run: None,
            next_scheduled_at,
        };
        task.validate().map_err(CyclerError::Task)?;
        tasks.push(task);
    }
    Ok(tasks)
}

pub async fn save_tasks(path: &Path, tasks: &[ScheduledTask]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = serialize_tasks(tasks);
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Load the task file; an absent file yields an empty list.
pub async fn load_tasks(path: &Path) -> Result<Vec<ScheduledTask>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_tasks(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}
