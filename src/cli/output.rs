use devstack_secrets::report::{StepReport, all_skipped};

use crate::commands::status::StatusSummary;

pub(crate) fn print_step_table(title: &str, reports: &[StepReport]) {
    println!("{title}");
    let width = reports
        .iter()
        .map(|report| report.step.len())
        .max()
        .unwrap_or(0);
    for report in reports {
        println!("  {:<width$}  {}", report.step, report.status);
    }
    if all_skipped(reports) {
        println!("Nothing to do; everything already exists.");
    }
}

pub(crate) fn print_status(summary: &StatusSummary) {
    println!("Secrets backend: {}", summary.vault_addr);
    match &summary.backend {
        Ok(state) => println!("  state: {state}"),
        Err(reason) => {
            println!("  state: unreachable ({reason})");
            return;
        }
    }
    if let Some(kv) = &summary.kv_mount {
        println!("  kv mount {}: {kv}", summary.kv_mount_name);
    }
    if let Some(note) = &summary.note {
        println!("  {note}");
    }
    if summary.services.is_empty() {
        return;
    }
    let width = summary
        .services
        .iter()
        .map(|service| service.name.len())
        .max()
        .unwrap_or(0);
    println!("Services:");
    for service in &summary.services {
        println!(
            "  {:<width$}  credential: {:<8}  certificate: {}",
            service.name, service.credential, service.certificate
        );
    }
}
