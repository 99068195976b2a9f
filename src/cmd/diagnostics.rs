//! Host prerequisite checks.

use anyhow::Result;

use boxctld::config::HostConfig;
use boxctld::docker::DockerService;

/// Print the state of everything the daemon depends on.
pub async fn run() -> Result<()> {
    let config = HostConfig::load();

    println!("boxctld diagnostics");
    println!();
    println!("Paths:");
    println!("  config:     {}", HostConfig::default_path().display());
    println!("  boxctl dir: {}", config.boxctl_dir().display());
    println!("  CLI socket: {}", config.socket_path().display());
    println!("  SSH socket: {}", config.ssh_socket_path().display());
    println!();

    print!("Docker engine: ");
    match DockerService::new() {
        Ok(docker) => match docker.ping().await {
            Ok(()) => println!("ok"),
            Err(e) => println!("unreachable ({e})"),
        },
        Err(e) => println!("unavailable ({e})"),
    }

    for tool in ["notify-send", "gdbus", "wl-copy", "xclip", "xsel", "ss", "tailscale"] {
        print!("{tool}: ");
        match tokio::process::Command::new(tool)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
        {
            Ok(_) => println!("found"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => println!("missing"),
            Err(e) => println!("error ({e})"),
        }
    }

    print!("tailscale IP: ");
    match boxctld::tailscale::current_ip().await {
        Some(ip) => println!("{ip}"),
        None => println!("unavailable"),
    }

    if let Some(project_dir) = boxctld::config::project::project_dir_from_env() {
        let config = boxctld::config::ProjectConfig::load(&project_dir);
        println!();
        println!("Project: {}", project_dir.display());
        println!("  config present: {}", config.exists());
        for workspace in config.model.missing_workspaces() {
            println!("  missing workspace: {}", workspace.path.display());
        }
    }

    Ok(())
}
