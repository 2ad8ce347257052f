use anyhow::{Context, Result};
use multiboot_core::{
    now_utc_rfc3339, OperationResult, PartitionPlan, PLAN_SCHEMA_VERSION, RESULT_SCHEMA_VERSION,
};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub plan_json: PathBuf,
    pub result_json: PathBuf,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    run_id: &'a str,
    created_at_utc: String,
    plan_schema_version: u32,
    result_schema_version: u32,
    disk_id: &'a str,
    status: String,
    meta: Option<Value>,
}

pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Writes `<base>/<run_id>/{plan.json,result.json,run.json,logs.txt}`.
pub fn write_run_report(
    base: impl AsRef<Path>,
    plan: &PartitionPlan,
    result: &OperationResult,
    meta: Option<Value>,
    logs: Option<&str>,
) -> Result<ReportPaths> {
    let run_id = if result.run_id.is_empty() {
        new_run_id()
    } else {
        result.run_id.clone()
    };
    let root = base.as_ref().join(&run_id);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create report directory {}", root.display()))?;

    let plan_json = root.join("plan.json");
    let result_json = root.join("result.json");
    let run_json = root.join("run.json");
    let logs_path = root.join("logs.txt");

    write_json(&plan_json, plan)?;
    write_json(&result_json, result)?;

    let run_meta = RunMetadata {
        run_id: &run_id,
        created_at_utc: now_utc_rfc3339(),
        plan_schema_version: PLAN_SCHEMA_VERSION,
        result_schema_version: RESULT_SCHEMA_VERSION,
        disk_id: &result.disk_id,
        status: result.status.to_string(),
        meta,
    };
    write_json(&run_json, &run_meta)?;

    std::fs::write(&logs_path, logs.unwrap_or(""))
        .with_context(|| format!("write {}", logs_path.display()))?;

    Ok(ReportPaths {
        run_id,
        root,
        plan_json,
        result_json,
        run_json,
        logs_path,
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))
}
