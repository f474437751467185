//! Info broker queries.

use anyhow::{bail, Result};
use clap::Args;
use serde::Deserialize;

use crate::output::print_json;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct InfoArgs {
    /// Info key, e.g. `infrastructure.scaling`.
    pub key: String,

    /// Query parameters as KEY=VALUE pairs.
    #[arg(value_name = "KEY=VALUE")]
    pub params: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    result: serde_json::Value,
}

pub async fn query(ctx: CommandContext, args: InfoArgs) -> Result<()> {
    let mut pairs = Vec::with_capacity(args.params.len());
    for param in &args.params {
        let Some((key, value)) = param.split_once('=') else {
            bail!("parameter '{param}' is not in KEY=VALUE form");
        };
        pairs.push(format!("{key}={value}"));
    }

    let mut path = format!("/info/{}", args.key);
    if !pairs.is_empty() {
        path.push('?');
        path.push_str(&pairs.join("&"));
    }

    let response: InfoResponse = ctx.client.get(&path).await?;
    print_json(&response.result);
    Ok(())
}
