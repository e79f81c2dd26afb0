//! Image commands - build, push, pull, list and purge kard images

use console::style;
use pkr_driver::{BuildOptions, PurgeOptions, RegistryOptions};

use super::{Globals, Session};
use crate::display::{pluralize, print_build_report, print_list, spinner, success};
use crate::error::Result;

pub async fn build(globals: &Globals, services: &[String], options: &BuildOptions) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let bar = spinner(format!("building images of {name}"), session.quiet());
    let result = lifecycle.build(&name, services, options).await;
    bar.finish_and_clear();

    print_build_report(&result?);
    Ok(())
}

pub async fn push(
    globals: &Globals,
    services: &[String],
    options: &RegistryOptions,
) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let bar = spinner("pushing images", session.quiet());
    let result = lifecycle.push(&name, services, options).await;
    bar.finish_and_clear();

    let pushed = result?;
    for image in &pushed {
        println!("  {} {}", style("pushed").green(), image);
    }
    success(format!("{} pushed", pluralize(pushed.len(), "image", "images")));
    Ok(())
}

pub async fn pull(
    globals: &Globals,
    services: &[String],
    options: &RegistryOptions,
) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let bar = spinner("pulling images", session.quiet());
    let result = lifecycle.pull(&name, services, options).await;
    bar.finish_and_clear();

    let pulled = result?;
    for image in &pulled {
        println!("  {} {}", style("pulled").green(), image);
    }
    success(format!("{} pulled", pluralize(pulled.len(), "image", "images")));
    Ok(())
}

pub fn list(globals: &Globals, services: &[String], tag: Option<&str>) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let images = lifecycle.list_images(&name, services, tag)?;
    print_list("Images:", &images, "No image found.");
    Ok(())
}

pub async fn purge(globals: &Globals, options: &PurgeOptions) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let removed = lifecycle.purge(&name, options).await?;
    for image in &removed {
        println!("  {} {}", style("removed").red(), image);
    }
    success(format!("{} removed", pluralize(removed.len(), "image", "images")));
    Ok(())
}
