//! Infrastructure lifecycle commands.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::output::{print_json, print_output, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct InfraArgs {
    /// Infrastructure ID.
    pub infra_id: String,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Description file (YAML or JSON).
    pub file: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct InfraIdResponse {
    infraid: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListResponse {
    infrastructures: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DetachResponse {
    infraid: String,
    outcome: String,
    elapsed_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct InfraReport {
    infraid: String,
    #[serde(default)]
    name: String,
    managed: bool,
    nodes: BTreeMap<String, NodeReport>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeReport {
    instances: BTreeMap<String, InstanceReport>,
    scaling: ScalingReport,
}

#[derive(Debug, Serialize, Deserialize)]
struct InstanceReport {
    resource_address: Option<String>,
    state: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScalingReport {
    actual: u32,
    target: u32,
    min: u32,
    max: u32,
}

#[derive(Debug, Tabled)]
struct IdRow {
    #[tabled(rename = "ID")]
    id: String,
}

#[derive(Debug, Tabled)]
struct InstanceRow {
    #[tabled(rename = "Node")]
    node: String,

    #[tabled(rename = "Instance")]
    instance: String,

    #[tabled(rename = "Address")]
    address: String,

    #[tabled(rename = "State")]
    state: String,
}

#[derive(Debug, Tabled)]
struct ScalingRow {
    #[tabled(rename = "Node")]
    node: String,

    #[tabled(rename = "Actual")]
    actual: u32,

    #[tabled(rename = "Target")]
    target: u32,

    #[tabled(rename = "Bounds")]
    bounds: String,
}

pub async fn list(ctx: CommandContext) -> Result<()> {
    let response: ListResponse = ctx.client.get("/infrastructures/").await?;
    let rows: Vec<_> = response
        .infrastructures
        .iter()
        .map(|id| IdRow { id: id.clone() })
        .collect();
    print_output(&rows, &response, ctx.format);
    Ok(())
}

pub async fn get(ctx: CommandContext, args: InfraArgs) -> Result<()> {
    let report: InfraReport = ctx
        .client
        .get(&format!("/infrastructures/{}", args.infra_id))
        .await?;

    if ctx.format == OutputFormat::Json {
        print_json(&report);
        return Ok(());
    }

    println!(
        "{} ({}) managed: {}",
        report.infraid, report.name, report.managed
    );

    let scaling: Vec<_> = report
        .nodes
        .iter()
        .map(|(node, r)| ScalingRow {
            node: node.clone(),
            actual: r.scaling.actual,
            target: r.scaling.target,
            bounds: format!("{}..={}", r.scaling.min, r.scaling.max),
        })
        .collect();
    print_output(&scaling, &report, ctx.format);

    let instances: Vec<_> = report
        .nodes
        .iter()
        .flat_map(|(node, r)| {
            r.instances.iter().map(move |(id, i)| InstanceRow {
                node: node.clone(),
                instance: id.clone(),
                address: i.resource_address.clone().unwrap_or_else(|| "-".to_string()),
                state: i.state.clone(),
            })
        })
        .collect();
    print_output(&instances, &report, ctx.format);
    Ok(())
}

pub async fn create(ctx: CommandContext, args: CreateArgs) -> Result<()> {
    let body = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let response: InfraIdResponse = ctx.client.post("/infrastructures/", body).await?;
    print_success(
        &format!("Created infrastructure {}", response.infraid),
        &response,
        ctx.format,
    );
    Ok(())
}

pub async fn delete(ctx: CommandContext, args: InfraArgs) -> Result<()> {
    let response: InfraIdResponse = ctx
        .client
        .delete(&format!("/infrastructures/{}", args.infra_id))
        .await?;
    print_success(
        &format!("Tore down infrastructure {}", response.infraid),
        &response,
        ctx.format,
    );
    Ok(())
}

pub async fn attach(ctx: CommandContext, args: InfraArgs) -> Result<()> {
    let response: InfraIdResponse = ctx
        .client
        .post(&format!("/infrastructures/{}/attach", args.infra_id), String::new())
        .await?;
    print_success(
        &format!("Attached infrastructure {}", response.infraid),
        &response,
        ctx.format,
    );
    Ok(())
}

pub async fn detach(ctx: CommandContext, args: InfraArgs) -> Result<()> {
    let response: DetachResponse = ctx
        .client
        .post(&format!("/infrastructures/{}/detach", args.infra_id), String::new())
        .await?;
    print_success(
        &format!(
            "Detached infrastructure {} ({}, {} ms)",
            response.infraid, response.outcome, response.elapsed_ms
        ),
        &response,
        ctx.format,
    );
    Ok(())
}
