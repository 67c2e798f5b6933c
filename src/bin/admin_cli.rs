//! Administrative CLI surface. Each subcommand is a standalone operation
//! on users, sessions, and failed-attempt records: a session id (the raw
//! bearer token from an admin login) is the first positional argument
//! everywhere except `login`, which mints that token.
//!
//! Exit codes: `0` success, `1` auth/logic error, `2` argument error.
//! Successful operations that produce data print JSON to stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use securevault_lib::app_state::AppState;
use securevault_lib::model::ScalarValue;
use securevault_lib::{admin, config, login};
use securevault_lib::login::Surface;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "admin-cli")]
#[command(about = "SecureVault administrative command-line surface", long_about = None)]
struct Args {
    #[arg(long)]
    env_file: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticates on the admin surface (requires dev_admin) and prints
    /// the session token other subcommands take as their first argument.
    Login {
        username: String,
        password: String,
        totp_code: Option<String>,
    },
    ListUsers {
        session: String,
    },
    ListSessions {
        session: String,
    },
    ListAttempts {
        session: String,
    },
    LogoutUser {
        session: String,
        user_id: String,
    },
    LogoutSelf {
        session: String,
    },
    LogoutAll {
        session: String,
    },
    ClearAllAttempts {
        session: String,
    },
    UserAction {
        session: String,
        action: String,
        user_id: String,
    },
    CreateUser {
        session: String,
        username: String,
        password: String,
        /// Additional `key=value` overrides, coerced per model::ScalarValue::auto_cast.
        overrides: Vec<String>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let (secrets, settings) = match config::load(args.env_file, args.data_dir) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::from(1);
        }
    };
    let state = AppState::new(secrets, settings);

    match run(&state, args.command) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap());
            ExitCode::from(0)
        }
        Err(CliError::Argument(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(2)
        }
        Err(CliError::Auth(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(1)
        }
    }
}

enum CliError {
    Argument(String),
    Auth(String),
}

impl From<securevault_lib::error::AppError> for CliError {
    fn from(err: securevault_lib::error::AppError) -> Self {
        CliError::Auth(err.to_string())
    }
}

fn run(state: &AppState, command: Command) -> Result<serde_json::Value, CliError> {
    match command {
        Command::Login { username, password, totp_code } => {
            let outcome = login::authenticate(state, &username, &password, totp_code.as_deref(), Surface::Admin)?;
            match outcome {
                login::AuthOutcome::Success(auth) => Ok(json!({
                    "code": auth.code,
                    "session": auth.issued.raw_token,
                    "csrf": auth.issued.csrf,
                })),
                login::AuthOutcome::TwoFaSetupRequired { totp_uri } => Ok(json!({
                    "code": login::code::TWO_FA_SETUP_REQUIRED,
                    "totp_uri": totp_uri,
                })),
                login::AuthOutcome::Failure { code, message } => {
                    Err(CliError::Auth(format!("{message} (code {code})")))
                }
            }
        }
        Command::ListUsers { session } => {
            admin::authenticate_session(state, &session)?;
            Ok(admin::list_users(state)?)
        }
        Command::ListSessions { session } => {
            admin::authenticate_session(state, &session)?;
            Ok(admin::list_sessions(state)?)
        }
        Command::ListAttempts { session } => {
            admin::authenticate_session(state, &session)?;
            Ok(admin::list_attempts(state)?)
        }
        Command::LogoutUser { session, user_id } => {
            admin::authenticate_session(state, &session)?;
            admin::logout_user(state, &user_id)?;
            Ok(json!({"success": true}))
        }
        Command::LogoutSelf { session } => {
            admin::authenticate_session(state, &session)?;
            admin::logout_self(state, &session)?;
            Ok(json!({"success": true}))
        }
        Command::LogoutAll { session } => {
            admin::authenticate_session(state, &session)?;
            admin::logout_all(state)?;
            Ok(json!({"success": true}))
        }
        Command::ClearAllAttempts { session } => {
            admin::authenticate_session(state, &session)?;
            admin::clear_all_attempts(state)?;
            Ok(json!({"success": true}))
        }
        Command::UserAction { session, action, user_id } => {
            admin::authenticate_session(state, &session)?;
            admin::user_action(state, &user_id, &action)?;
            Ok(json!({"success": true}))
        }
        Command::CreateUser { session, username, password, overrides } => {
            admin::authenticate_session(state, &session)?;
            let parsed = parse_overrides(&overrides)?;
            let id = admin::create_user(state, &username, &password, parsed)?;
            Ok(json!({"id": id}))
        }
    }
}

fn parse_overrides(raw: &[String]) -> Result<Vec<(String, ScalarValue)>, CliError> {
    raw.iter()
        .map(|entry| {
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                CliError::Argument(format!("override `{entry}` must be in key=value form"))
            })?;
            Ok((key.to_string(), ScalarValue::auto_cast(value)))
        })
        .collect()
}
