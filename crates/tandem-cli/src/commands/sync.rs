use tandem_core::client::{SyncReport, SyncTransport};

use crate::commands::common::{format_event, format_report, format_status_lines};
use crate::error::CliError;
use crate::session::Session;

pub async fn run_sync<T: SyncTransport>(
    session: &Session<T>,
    full: bool,
) -> Result<SyncReport, CliError> {
    let driver = session.driver();
    let report = if full {
        driver.force_full_sync().await?
    } else {
        driver.trigger_sync().await?
    };

    println!("{}", format_report(&report));
    for error in &report.errors {
        println!("  {error}");
    }
    if report.conflicts > 0 {
        println!("Run `tandem conflicts` to review conflicts");
    }
    Ok(report)
}

pub fn run_status<T: SyncTransport>(session: &Session<T>, as_json: bool) -> Result<(), CliError> {
    let driver = session.driver();
    let status = driver.status()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let identity = driver.identity();
    println!("Device:       {} ({})", identity.device_id, identity.platform);
    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_watch<T: SyncTransport>(session: &Session<T>) -> Result<(), CliError> {
    let driver = session.driver();
    let listener = driver.add_listener(|event| println!("{}", format_event(event)));
    let handle = driver.start();
    println!(
        "Syncing every {}s; press Ctrl-C to stop",
        driver.config().sync_interval.as_secs()
    );

    let interrupted = tokio::signal::ctrl_c().await;
    driver.stop();
    handle.join().await;
    driver.remove_listener(listener);
    interrupted?;
    Ok(())
}

pub fn run_reset<T: SyncTransport>(session: &Session<T>) -> Result<(), CliError> {
    session.reset()?;
    println!("Cleared local sync data");
    Ok(())
}
