use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Users,
    User(i64),
    Chats,
    Open(i64),
    New,
    Delete(i64),
    Attach(Vec<PathBuf>),
    Link(String),
    /// 1-based position in the staged list.
    Detach(usize),
    Staged,
    History,
    /// Send even if another send is in flight, superseding it.
    Force(String),
    Send(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  /users              list users
  /user <id>          switch to a user and load their chats
  /chats              list chats grouped by age
  /open <chat_id>     open a chat and load its history
  /new                return to the welcome view
  /delete <chat_id>   delete a chat
  /attach <path>...   stage local files
  /link <url>         stage a link
  /detach <n>         remove the n-th staged attachment
  /staged             list staged attachments
  /history            print the displayed messages
  /force <text>       send, superseding an in-flight send
  /quit               exit
anything else is sent as a message";

fn id_arg(command: &str, rest: &str) -> Result<i64> {
    rest.trim()
        .parse()
        .with_context(|| format!("{command} expects a numeric id, got '{}'", rest.trim()))
}

pub fn parse(line: &str) -> Result<Command> {
    let line = line.trim();
    let Some(body) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    let (name, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
    let rest = rest.trim();

    let command = match name {
        "users" => Command::Users,
        "user" => Command::User(id_arg("/user", rest)?),
        "chats" => Command::Chats,
        "open" => Command::Open(id_arg("/open", rest)?),
        "new" => Command::New,
        "delete" => Command::Delete(id_arg("/delete", rest)?),
        "attach" => {
            if rest.is_empty() {
                bail!("/attach expects at least one path");
            }
            Command::Attach(rest.split_whitespace().map(PathBuf::from).collect())
        }
        "link" => Command::Link(rest.to_string()),
        "detach" => {
            let index: usize = rest
                .parse()
                .with_context(|| format!("/detach expects a position, got '{rest}'"))?;
            if index == 0 {
                bail!("/detach positions start at 1");
            }
            Command::Detach(index)
        }
        "staged" => Command::Staged,
        "history" => Command::History,
        "force" => Command::Force(rest.to_string()),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '/{other}', try /help"),
    };
    Ok(command)
}
