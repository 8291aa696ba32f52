use colored::Colorize;

use crate::brokerpak::reader::PakEntry;
use crate::brokerpak::{Manifest, ServiceDefinition};
use crate::storage::{operation_state, TerraformDeployment, TerraformDeploymentListEntry};

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

/// Print an error message.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg.red());
}

fn colored_state(state: &str) -> String {
    match state {
        operation_state::SUCCEEDED => state.green().to_string(),
        operation_state::FAILED => state.red().to_string(),
        operation_state::IN_PROGRESS => state.yellow().to_string(),
        _ => state.dimmed().to_string(),
    }
}

// ─── Brokerpaks ─────────────────────────────────────────────────────────────

/// `pak info`: manifest summary, catalog and archive contents.
pub fn print_pak_info(manifest: &Manifest, services: &[ServiceDefinition], entries: &[PakEntry]) {
    println!();
    println!("{}", "Information".bold().cyan());
    println!("{}", "─".repeat(80));
    println!("  {:<18} {}", "Name:".bold(), manifest.name);
    println!("  {:<18} {}", "Version:".bold(), manifest.version);
    for (k, v) in &manifest.metadata {
        println!("  {:<18} {}", format!("{k}:").bold(), v);
    }

    println!();
    println!("{}", "Parameters".bold().cyan());
    println!("{}", "─".repeat(80));
    if manifest.parameters.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for p in &manifest.parameters {
        println!("  {:<30} {}", p.name, p.description);
    }

    println!();
    println!("{}", "Binaries".bold().cyan());
    println!("{}", "─".repeat(80));
    for b in &manifest.binaries {
        let marker = if b.default { " (default)".green().to_string() } else { String::new() };
        println!("  {:<30} {}{}", b.name, b.version, marker);
    }

    println!();
    println!("{}", "Services".bold().cyan());
    println!("{}", "─".repeat(80));
    println!("  {:<38} {:<30} {}", "ID".bold(), "NAME".bold(), "PLANS".bold());
    for svc in services {
        let plans: Vec<&str> = svc.plans.iter().map(|p| p.name.as_str()).collect();
        println!("  {:<38} {:<30} {}", svc.id, svc.name, plans.join(", "));
    }

    println!();
    println!("{}", "Contents".bold().cyan());
    println!("{}", "─".repeat(80));
    for e in entries {
        println!("  {:>12}  {}", e.size, e.name);
    }
    println!();
}

// ─── Deployments ────────────────────────────────────────────────────────────

/// `tf dump`: status and workspace of one deployment.
pub fn print_deployment(d: &TerraformDeployment) {
    println!();
    println!("{} {}", "Deployment:".bold().cyan(), d.id.bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "Operation:".bold(), d.last_operation_type);
    println!("  {:<18} {}", "State:".bold(), colored_state(&d.last_operation_state));
    println!("  {:<18} {}", "Message:".bold(), d.last_operation_message);
    println!();
    for line in d.workspace.describe().lines() {
        println!("  {line}");
    }
    println!("{}", "─".repeat(60));
    println!();
}

/// `tf list`: one line per stored deployment.
pub fn print_deployment_list(entries: &[TerraformDeploymentListEntry]) {
    if entries.is_empty() {
        println!("{}", "No deployments.".dimmed());
        return;
    }
    println!();
    println!(
        "  {:<60} {:<12} {:<12} {}",
        "ID".bold(),
        "OPERATION".bold(),
        "STATE".bold(),
        "UPDATED".bold()
    );
    println!("{}", "─".repeat(100));
    for e in entries {
        println!(
            "  {:<60} {:<12} {:<12} {}",
            e.id,
            e.last_operation_type,
            colored_state(&e.last_operation_state),
            e.updated_at
        );
    }
    println!();
    println!("  {} deployment(s) total.", entries.len());
    println!();
}
