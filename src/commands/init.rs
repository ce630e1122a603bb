//! Init command implementation

use crate::catalog::Catalog;
use crate::config::Config;
use crate::convert::crs::Crs;
use crate::error::{Error, Result};
use crossterm::cursor;
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub force: bool,
    pub non_interactive: bool,
    pub yes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitAction {
    Abort,
    Overwrite,
    Merge,
}

/// Initialize geoingest configuration and catalog
pub async fn cmd_init(options: InitOptions) -> Result<()> {
    let InitOptions {
        base_dir,
        config_path,
        force,
        non_interactive,
        yes,
    } = options;

    let is_tty = io::stdin().is_terminal();
    let interactive = resolve_interactive(is_tty, non_interactive)?;
    let auto_accept = yes || non_interactive;

    let action = if config_path.exists() {
        if force {
            InitAction::Overwrite
        } else if !interactive {
            return Err(Error::Config(format!(
                "Config already exists at {}. Use --force or run interactively.",
                config_path.display()
            )));
        } else {
            prompt_init_action(auto_accept)?
        }
    } else {
        InitAction::Overwrite
    };

    let mut config = match action {
        InitAction::Abort => {
            println!("Initialization aborted.");
            return Ok(());
        }
        InitAction::Merge => Config::load(&config_path)?,
        InitAction::Overwrite => Config::with_base_dir(&base_dir),
    };
    config.paths.config_file = config_path.clone();

    if interactive && !auto_accept {
        run_init_wizard(&mut config)?;
    }
    config.validate()?;

    if interactive && !auto_accept {
        println!("\nConfiguration preview:\n");
        println!("{}", toml::to_string_pretty(&config)?);
        if !prompt_confirm("Write this configuration?", true, auto_accept)? {
            println!("Initialization aborted.");
            return Ok(());
        }
    }

    config.save()?;

    let catalog = Catalog::connect(&config).await?;
    catalog.init_schema().await?;
    info!("Created catalog at {:?}", config.paths.db_file);

    println!("✓ Initialized geoingest at {:?}", config.paths.base_dir);
    println!("\nConfiguration: {:?}", config.paths.config_file);
    println!("Catalog: {:?}", config.paths.db_file);
    println!("Data directory: {:?}", config.data_dir);
    if config.owner.is_none() {
        println!("\n⚠ No owner configured; pass --owner to 'geoingest ingest' or set `owner`.");
    }
    println!("\nNext steps:");
    println!("  geoingest ingest manifest.json          # Ingest a manifest under the data directory");
    println!("  geoingest jobs                          # Poll conversion and analysis jobs");

    Ok(())
}

fn resolve_interactive(is_tty: bool, non_interactive: bool) -> Result<bool> {
    if !is_tty && !non_interactive {
        return Err(Error::Config(
            "stdin is not a TTY. Use --non-interactive to write defaults.".to_string(),
        ));
    }
    Ok(is_tty && !non_interactive)
}

fn prompt_init_action(auto_accept: bool) -> Result<InitAction> {
    if auto_accept {
        return Ok(InitAction::Overwrite);
    }

    let options = ["Abort", "Overwrite", "Merge/update interactively"];
    let selection = prompt_select("Config exists. Choose an action:", &options, 0, auto_accept)?;
    Ok(match selection {
        0 => InitAction::Abort,
        1 => InitAction::Overwrite,
        _ => InitAction::Merge,
    })
}

fn run_init_wizard(config: &mut Config) -> Result<()> {
    let data_dir = prompt_string(
        "Data directory (manifests and downloads)",
        &config.data_dir.display().to_string(),
        |value| {
            if value.trim().is_empty() {
                Err("Data directory cannot be empty.".to_string())
            } else {
                Ok(())
            }
        },
        false,
    )?;
    config.data_dir = PathBuf::from(data_dir);

    let owner = prompt_string(
        "Administrative owner (blank for none)",
        config.owner.as_deref().unwrap_or(""),
        |_| Ok(()),
        false,
    )?;
    config.owner = Some(owner.trim().to_string()).filter(|o| !o.is_empty());

    config.canonical_crs = prompt_string(
        "Canonical coordinate reference",
        &config.canonical_crs,
        |value| match Crs::parse(value) {
            Some(_) => Ok(()),
            None => Err("Enter an EPSG code such as EPSG:4326.".to_string()),
        },
        false,
    )?;

    if prompt_confirm("Configure an external flood model command?", false, false)? {
        let command = prompt_string(
            "Flood model command (space separated argv)",
            &config
                .analytics
                .flood_model_command
                .clone()
                .unwrap_or_default()
                .join(" "),
            |value| {
                if value.split_whitespace().next().is_none() {
                    Err("Enter an executable name.".to_string())
                } else {
                    Ok(())
                }
            },
            false,
        )?;
        config.analytics.flood_model_command =
            Some(command.split_whitespace().map(str::to_string).collect());
    }

    Ok(())
}

/// Yes/No selection; `auto_accept` answers with `default` without prompting
pub fn prompt_confirm(label: &str, default: bool, auto_accept: bool) -> Result<bool> {
    if auto_accept {
        return Ok(default);
    }
    let options = ["Yes", "No"];
    let default_index = if default { 0 } else { 1 };
    let selection = prompt_select(label, &options, default_index, auto_accept)?;
    Ok(selection == 0)
}

fn prompt_select(label: &str, options: &[impl AsRef<str>], default_index: usize, auto_accept: bool) -> Result<usize> {
    if auto_accept {
        return Ok(default_index.min(options.len().saturating_sub(1)));
    }

    let mut stdout = io::stdout();
    let mut selected = default_index.min(options.len().saturating_sub(1));
    let _raw_mode = RawModeGuard::new()?;

    loop {
        execute!(
            stdout,
            terminal::Clear(terminal::ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        write!(stdout, "{}\r\n", label)?;
        for (idx, option) in options.iter().enumerate() {
            let marker = if idx == selected { ">" } else { " " };
            write!(stdout, "{} {}\r\n", marker, option.as_ref())?;
        }
        stdout.flush()?;

        if let Event::Key(key) = event::read()? {
            match key.code {
                KeyCode::Up => selected = selected.saturating_sub(1),
                KeyCode::Down if selected + 1 < options.len() => selected += 1,
                KeyCode::Enter => {
                    execute!(
                        stdout,
                        terminal::Clear(terminal::ClearType::FromCursorDown),
                        cursor::MoveToColumn(0)
                    )?;
                    return Ok(selected);
                }
                KeyCode::Esc => return Err(Error::Aborted("selection cancelled".to_string())),
                _ => {}
            }
        }
    }
}

fn prompt_string<F>(label: &str, default: &str, validate: F, auto_accept: bool) -> Result<String>
where
    F: Fn(&str) -> std::result::Result<(), String>,
{
    if auto_accept {
        return Ok(default.to_string());
    }

    loop {
        print!("{} [{}]: ", label, default);
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let value = input.trim();
        let value = if value.is_empty() { default } else { value };

        if let Err(message) = validate(value) {
            println!("{}", message);
            continue;
        }
        return Ok(value.to_string());
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}
