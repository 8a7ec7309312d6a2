//! Credential management commands

use crate::config::Credentials;
use anyhow::Result;
use console::style;

/// Store an API key locally. Prompts when no key is given.
pub async fn login(api_key: Option<String>) -> Result<()> {
    cliclack::intro(style(" burrow ").on_cyan().black().to_string())?;

    let api_key = match api_key {
        Some(key) => key,
        None => cliclack::password("Paste your API key").mask('*').interact()?,
    };

    if api_key.trim().is_empty() {
        cliclack::outro_cancel("API key cannot be empty")?;
        anyhow::bail!("API key cannot be empty");
    }

    Credentials {
        api_key: api_key.trim().to_string(),
    }
    .save()?;

    cliclack::outro(format!(
        "Credentials saved to {}",
        style(crate::config::credentials_file().display()).cyan()
    ))?;
    Ok(())
}

/// Remove the stored credential.
pub async fn logout() -> Result<()> {
    if Credentials::delete()? {
        println!("{} Logged out", style("◆").green());
    } else {
        println!("{} No stored credentials", style("◇").yellow());
    }
    Ok(())
}

/// Report whether a credential is stored.
pub async fn status() -> Result<()> {
    match Credentials::load()? {
        Some(creds) => {
            let masked = if creds.api_key.len() > 8 {
                format!("{}...", &creds.api_key[..8])
            } else {
                "***".to_string()
            };
            println!(
                "{} Logged in ({})",
                style("◆").green(),
                style(masked).dim()
            );
        }
        None => {
            println!(
                "{} Not logged in. Run {} first.",
                style("◇").yellow(),
                style("burrow auth login").cyan()
            );
        }
    }
    Ok(())
}
