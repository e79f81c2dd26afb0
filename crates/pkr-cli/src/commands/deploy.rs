//! Deploy commands - up, down, start, restart, clean and ps

use super::{Globals, Session};
use crate::display::{print_deploy_report, print_list, spinner, success};
use crate::error::Result;

pub async fn up(globals: &Globals, services: &[String]) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let bar = spinner(format!("starting {name}"), session.quiet());
    let result = lifecycle.up(&name, services).await;
    bar.finish_and_clear();

    print_deploy_report(&result?, "started");
    Ok(())
}

pub async fn start(globals: &Globals, services: &[String]) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let bar = spinner(format!("starting {name}"), session.quiet());
    let result = lifecycle.start(&name, services).await;
    bar.finish_and_clear();

    print_deploy_report(&result?, "started");
    Ok(())
}

/// Also serves `stop`
pub async fn down(globals: &Globals, services: &[String]) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let bar = spinner(format!("stopping {name}"), session.quiet());
    let result = lifecycle.down(&name, services).await;
    bar.finish_and_clear();

    print_deploy_report(&result?, "stopped");
    Ok(())
}

pub async fn restart(globals: &Globals, services: &[String]) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    lifecycle.restart(&name, services).await?;
    if services.is_empty() {
        success(format!("{name} restarted"));
    } else {
        success(format!("restarted: {}", services.join(", ")));
    }
    Ok(())
}

pub async fn clean(globals: &Globals, kill: bool) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    lifecycle.clean(&name, kill).await?;
    success(format!("{name} cleaned"));
    Ok(())
}

pub async fn ps(globals: &Globals) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let running = lifecycle.ps(&name).await?;
    print_list("Running:", &running, "Nothing is running.");
    Ok(())
}
