//! Registers this binary as an MCP server with the desktop clients we know
//! about.

use color_eyre::eyre::{eyre, Result, WrapErr};
use color_eyre::Help;
use serde_json::{json, Map, Value};
use std::env;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

/// Key of our entry under `mcpServers`.
pub const SERVER_KEY: &str = "Blender";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpClient {
    Claude,
    Cursor,
    LmStudio,
}

impl McpClient {
    pub const ALL: [McpClient; 3] = [McpClient::Claude, McpClient::Cursor, McpClient::LmStudio];

    pub fn label(self) -> &'static str {
        match self {
            McpClient::Claude => "Claude",
            McpClient::Cursor => "Cursor",
            McpClient::LmStudio => "LM Studio",
        }
    }

    pub fn config_path(self) -> Result<PathBuf> {
        match self {
            McpClient::Claude => claude_config(),
            McpClient::Cursor => cursor_config(),
            McpClient::LmStudio => lm_studio_config(),
        }
    }
}

fn home_dir() -> Result<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or_else(|| eyre!("Could not determine HOME directory"))
}

fn app_data_dir() -> Result<PathBuf> {
    env::var_os("APPDATA")
        .map(PathBuf::from)
        .ok_or_else(|| eyre!("Could not find APPDATA directory"))
}

fn claude_config() -> Result<PathBuf> {
    if cfg!(target_os = "macos") {
        Ok(home_dir()?.join("Library/Application Support/Claude/claude_desktop_config.json"))
    } else if cfg!(target_os = "windows") {
        Ok(app_data_dir()?.join("Claude").join("claude_desktop_config.json"))
    } else {
        Err(eyre!("Claude Desktop is not available on this operating system"))
    }
}

fn cursor_config() -> Result<PathBuf> {
    Ok(home_dir()?.join(".cursor").join("mcp.json"))
}

fn lm_studio_config() -> Result<PathBuf> {
    let base = if cfg!(target_os = "macos") {
        home_dir()?.join("Library").join("Application Support")
    } else if cfg!(target_os = "windows") {
        app_data_dir()?
    } else {
        home_dir()?.join(".config")
    };
    Ok(base.join("LM Studio").join("mcpServers.json"))
}

#[cfg(target_os = "macos")]
fn get_exe_path() -> Result<PathBuf> {
    use color_eyre::eyre::OptionExt;
    use core_foundation::url::CFURL;

    let local_path = env::current_exe()?;
    let local_path_cref =
        CFURL::from_path(&local_path, false).ok_or_eyre("Could not resolve executable path")?;
    let un_relocated = security_translocate::create_original_path_for_url(local_path_cref.clone())
        .or_else(move |_| Ok::<CFURL, io::Error>(local_path_cref.clone()))?;
    un_relocated
        .to_path()
        .ok_or_eyre("Executable path is not a file path")
}

#[cfg(not(target_os = "macos"))]
fn get_exe_path() -> io::Result<PathBuf> {
    env::current_exe()
}

fn server_entry(exe_path: &Path, allow_code_execution: bool) -> Value {
    let mut args = vec!["server"];
    if allow_code_execution {
        args.push("--allow-code-execution");
    }
    json!({
        "command": exe_path,
        "args": args,
    })
}

fn read_config(config_path: &Path, client: &str) -> Result<Map<String, Value>> {
    if !config_path.exists() {
        return Ok(Map::new());
    }
    let file = File::open(config_path)
        .wrap_err_with(|| format!("Could not read {client} config file at {config_path:?}"))?;
    serde_json::from_reader(BufReader::new(file))
        .wrap_err_with(|| format!("{client} config file at {config_path:?} is not a JSON object"))
}

/// Adds or replaces our entry in the client config at `config_path`, keeping
/// every other server and top-level key intact.
pub fn install_to_config(
    config_path: &Path,
    exe_path: &Path,
    client: &str,
    allow_code_execution: bool,
) -> Result<()> {
    let mut config = read_config(config_path, client)?;
    if !matches!(config.get("mcpServers"), Some(Value::Object(_))) {
        config.insert("mcpServers".to_string(), json!({}));
    }
    config["mcpServers"][SERVER_KEY] = server_entry(exe_path, allow_code_execution);

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Could not create {client} config directory {parent:?}"))?;
    }
    let mut file = File::create(config_path)
        .wrap_err_with(|| format!("Could not create {client} config file at {config_path:?}"))?;
    file.write_all(serde_json::to_string_pretty(&config)?.as_bytes())
        .wrap_err_with(|| format!("Could not write to {client} config file at {config_path:?}"))?;

    tracing::info!("Registered Blender MCP in {client} config {config_path:?}");
    println!("Installed Blender MCP to {client} config {config_path:?}");
    Ok(())
}

fn install_client(client: McpClient, allow_code_execution: bool) -> Result<&'static str> {
    let exe = get_exe_path()?;
    install_to_config(&client.config_path()?, &exe, client.label(), allow_code_execution)?;
    Ok(client.label())
}

fn get_message(successes: String) -> String {
    format!("Blender MCP is ready to go.
Please restart your MCP clients to apply the changes, then start the MCP server add-on inside Blender.

MCP Clients set up:
{successes}

Note: connecting a third-party LLM to Blender via an MCP server will share your scene data with that external service provider. Please review their privacy practices carefully before proceeding.
To uninstall, remove the \"{SERVER_KEY}\" entry from each client's MCP config.")
}

async fn install_internal(allow_code_execution: bool) -> Result<String> {
    let mut errors = vec![];
    let successes: Vec<_> = McpClient::ALL
        .into_iter()
        .map(|client| install_client(client, allow_code_execution))
        .filter_map(|r| r.map_err(|e| errors.push(e)).ok())
        .collect();

    if successes.is_empty() {
        let error = errors.into_iter().fold(
            eyre!("Failed to install to any supported MCP clients"),
            |report, e| report.note(e),
        );
        return Err(error);
    }

    println!();
    let msg = get_message(successes.join("\n"));
    println!("{msg}");
    Ok(msg)
}

/// Interactive menu for registering with one client at a time.
pub async fn setup(allow_code_execution: bool) -> Result<()> {
    use dialoguer::{theme::ColorfulTheme, Select};

    let mut options: Vec<String> = McpClient::ALL
        .iter()
        .map(|client| format!("Install/Update {} MCP connection", client.label()))
        .collect();
    options.push("Exit".to_string());

    let theme = ColorfulTheme::default();
    loop {
        let selection = Select::with_theme(&theme)
            .with_prompt("Select an action to perform")
            .items(&options)
            .default(0)
            .interact_opt()?;

        let Some(index) = selection else {
            println!("Exiting installer.");
            break;
        };
        let Some(&client) = McpClient::ALL.get(index) else {
            println!("Exiting installer.");
            break;
        };

        let label = &options[index];
        match install_client(client, allow_code_execution) {
            Ok(_) => println!("{label} completed successfully.\n"),
            Err(error) => eprintln!("{label} failed: {error:#}\n"),
        }
    }
    Ok(())
}

#[cfg(target_os = "windows")]
pub async fn install(allow_code_execution: bool) -> Result<()> {
    use std::process::Command;
    if let Err(e) = install_internal(allow_code_execution).await {
        tracing::error!("Failed to initialize Blender MCP: {:#}", e);
    }
    let _ = Command::new("cmd.exe").arg("/c").arg("pause").status();
    Ok(())
}

#[cfg(target_os = "macos")]
pub async fn install(allow_code_execution: bool) -> Result<()> {
    use native_dialog::{DialogBuilder, MessageLevel};
    let alert_builder = match install_internal(allow_code_execution).await {
        Err(e) => DialogBuilder::message()
            .set_level(MessageLevel::Error)
            .set_text(format!("Errors occurred: {e:#}")),
        Ok(msg) => DialogBuilder::message()
            .set_level(MessageLevel::Info)
            .set_text(msg),
    };
    let _ = alert_builder.set_title("Blender MCP").alert().show();
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub async fn install(allow_code_execution: bool) -> Result<()> {
    install_internal(allow_code_execution).await?;
    Ok(())
}
