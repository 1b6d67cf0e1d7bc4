//! `pipedesk-gate`: resolve the current user against the configured backend
//! and print the access decision for a protected view.
//!
//! ```text
//! pipedesk-gate [--role <role>] [--permission <key>] [<email> <password>]
//! ```

use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Serialize;

use pipedesk_auth::{AuthorizationExplanation, PermissionKey, PermissionVocabulary, Role};
use pipedesk_session::{
    AccessGate, BackendSettings, GateDecision, RestBackend, SessionSynchronizer,
    SynchronizerConfig,
};

const USAGE: &str =
    "usage: pipedesk-gate [--role <role>] [--permission <key>] [<email> <password>]";

#[derive(Debug, Default)]
struct Args {
    role: Option<Role>,
    permission: Option<PermissionKey>,
    credentials: Option<(String, String)>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut positional = Vec::new();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--role" => {
                let value = iter.next().context("--role needs a value")?;
                args.role = Some(value.parse()?);
            }
            "--permission" => {
                let value = iter.next().context("--permission needs a value")?;
                args.permission = Some(PermissionKey::parse(value)?);
            }
            _ => positional.push(arg),
        }
    }

    match positional.len() {
        0 => {}
        2 => {
            let password = positional.pop().unwrap_or_default();
            let email = positional.pop().unwrap_or_default();
            args.credentials = Some((email, password));
        }
        _ => bail!(USAGE),
    }
    Ok(args)
}

#[derive(Serialize)]
struct Report {
    user: Option<String>,
    name: Option<String>,
    role: Option<Role>,
    unprovisioned: bool,
    decision: GateDecision,
    explanations: Vec<AuthorizationExplanation>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pipedesk_observability::init();
    let args = parse_args()?;

    let settings = BackendSettings::from_env();
    let backend = Arc::new(RestBackend::new(&settings));
    let config =
        SynchronizerConfig::new(settings).with_vocabulary(PermissionVocabulary::crm_default());
    let handle = SessionSynchronizer::start(config, backend.clone(), backend);

    handle.settled().await?;
    if let Some((email, password)) = &args.credentials {
        handle.sign_in(email, password).await?;
        handle
            .wait_until(|ctx| ctx.session.is_some() && !ctx.loading)
            .await?;
    }

    let mut gate = AccessGate::new();
    if let Some(role) = args.role {
        gate = gate.with_role(role);
    }
    if let Some(permission) = args.permission.clone() {
        gate = gate.with_permission(permission);
    }

    let ctx = handle.context();
    let report = Report {
        user: ctx.user().map(|u| u.email.clone()),
        name: ctx.profile.as_ref().map(|p| p.display_name()),
        role: ctx.profile.as_ref().map(|p| p.role),
        unprovisioned: ctx.is_unprovisioned(),
        decision: gate.decide(&ctx),
        explanations: gate.explain(&ctx),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    handle.teardown().await;
    Ok(())
}
