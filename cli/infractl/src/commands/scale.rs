//! Scaling commands.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::output::print_success;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct ScaleUpArgs {
    /// Infrastructure ID.
    pub infra_id: String,

    /// Node name.
    pub node: String,

    /// Number of instances to add.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub count: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ScaleDownArgs {
    /// Infrastructure ID.
    pub infra_id: String,

    /// Node name.
    pub node: String,

    /// Specific instance to remove; otherwise one is selected.
    #[arg(long)]
    pub node_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScaleResponse {
    method: String,
    infraid: String,
    nodename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nodeid: Option<String>,
}

pub async fn scale_up(ctx: CommandContext, args: ScaleUpArgs) -> Result<()> {
    let mut path = format!("/infrastructures/{}/scaleup/{}", args.infra_id, args.node);
    if let Some(count) = args.count {
        path.push_str(&format!("/{count}"));
    }

    let response: ScaleResponse = ctx.client.post(&path, String::new()).await?;
    print_success(
        &format!(
            "Requested {} more instance(s) of {}",
            response.count.unwrap_or(1),
            response.nodename
        ),
        &response,
        ctx.format,
    );
    Ok(())
}

pub async fn scale_down(ctx: CommandContext, args: ScaleDownArgs) -> Result<()> {
    let mut path = format!("/infrastructures/{}/scaledown/{}", args.infra_id, args.node);
    if let Some(node_id) = args.node_id.as_deref() {
        path.push_str(&format!("/{node_id}"));
    }

    let response: ScaleResponse = ctx.client.post(&path, String::new()).await?;
    let target = response.nodeid.as_deref().unwrap_or("one instance");
    print_success(
        &format!("Requested removal of {} from {}", target, response.nodename),
        &response,
        ctx.format,
    );
    Ok(())
}
