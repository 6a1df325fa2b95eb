//! Command-line parsing and password input

use common::Secret;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{Error, Result};

pub const USAGE: &str = "\
usage: saga-auth [--config <path>] <command>

commands:
  login <server-url> <username>   sign in with a password (SAGA_PASSWORD or stdin)
  sso <server-url> <provider>     sign in through the server's OpenID provider
  users                           list signed-in users
  whoami                          show the current user
  switch <user-id>                make another user current
  remove <user-id>                forget a user and its token
  logout                          sign out the current user
  token                           print the current bearer token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { server_url: String, username: String },
    Sso { server_url: String, provider: String },
    Users,
    Whoami,
    Switch { user_id: String },
    Remove { user_id: String },
    Logout,
    Token,
    Help,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Invocation {
    pub config_path: Option<String>,
    pub command: Command,
}

/// Parse arguments (program name excluded).
pub fn parse(args: &[String]) -> Result<Invocation> {
    let mut config_path = None;
    let mut positional = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| Error::Usage("--config requires a path".into()))?;
                config_path = Some(path.clone());
            }
            "-h" | "--help" => {
                return Ok(Invocation {
                    config_path,
                    command: Command::Help,
                });
            }
            flag if flag.starts_with("--") => {
                return Err(Error::Usage(format!("unknown option: {flag}\n\n{USAGE}")));
            }
            _ => positional.push(arg.as_str()),
        }
    }

    let command = match positional.as_slice() {
        [] | ["help"] => Command::Help,
        ["login", server_url, username] => Command::Login {
            server_url: server_url.to_string(),
            username: username.to_string(),
        },
        ["sso", server_url, provider] => Command::Sso {
            server_url: server_url.to_string(),
            provider: provider.to_string(),
        },
        ["users"] => Command::Users,
        ["whoami"] => Command::Whoami,
        ["switch", user_id] => Command::Switch {
            user_id: user_id.to_string(),
        },
        ["remove", user_id] => Command::Remove {
            user_id: user_id.to_string(),
        },
        ["logout"] => Command::Logout,
        ["token"] => Command::Token,
        [name, ..] => {
            return Err(Error::Usage(format!(
                "unknown command or wrong arguments: {name}\n\n{USAGE}"
            )));
        }
    };

    Ok(Invocation {
        config_path,
        command,
    })
}

/// Password from `env_value` when set, otherwise the first line of `reader`.
pub async fn read_password<R>(env_value: Option<String>, mut reader: R) -> Result<Secret<String>>
where
    R: AsyncBufRead + Unpin,
{
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return Ok(Secret::new(value));
    }

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(len);
    let password = Secret::new(line);
    if password.expose().is_empty() {
        return Err(Error::MissingPassword);
    }
    Ok(password)
}
