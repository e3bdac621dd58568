/*
 * chatter is an interactive chatroom client. It connects to the
 * coordinator's user surface for account and room management, and to the
 * hosting chat node when entering a room. While in a room, received
 * messages print as they arrive and input lines are published; !leave
 * returns to the main prompt. If the room's chat node dies mid-session, the
 * client asks the coordinator to re-establish the room and rejoins.
 */

#![warn(clippy::all)]

use chatter::client::{ChatEvent, ChatSession, Client};
use chatter::error::{Error, Result};
use chatter::message::{Address, ChatroomResponse};

use rustyline::error::ReadlineError;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("host")
                .short('H')
                .long("host")
                .help("Coordinator host to connect to")
                .default_value("127.0.0.1"),
        )
        .arg(
            clap::Arg::new("port")
                .short('p')
                .long("port")
                .help("Coordinator user port to connect to")
                .default_value("9611"),
        )
        .get_matches();

    let host = args.get_one::<String>("host").unwrap().clone();
    let port = args
        .get_one::<String>("port")
        .unwrap()
        .parse::<u16>()
        .map_err(|e| Error::InvalidInput(format!("invalid port: {e}")))?;

    Repl::new(Address::new(host, port))?.run()
}

/// The REPL itself.
struct Repl {
    client: Client,
    editor: rustyline::DefaultEditor,
    /// Credentials once logged in, used for owner-gated operations.
    credentials: Option<(String, String)>,
}

impl Repl {
    fn new(coordinator: Address) -> Result<Self> {
        Ok(Self {
            client: Client::new(coordinator),
            editor: rustyline::DefaultEditor::new()?,
            credentials: None,
        })
    }

    fn run(mut self) -> Result<()> {
        println!("Connected to chatter coordinator. Enter !help for instructions.");
        loop {
            match self.editor.readline("chatter> ") {
                Ok(input) => {
                    let _ = self.editor.add_history_entry(&input);
                    if let Err(err) = self.command(input.trim()) {
                        println!("Error: {err}");
                    }
                }
                Err(ReadlineError::Eof | ReadlineError::Interrupted) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn command(&mut self, input: &str) -> Result<()> {
        let args: Vec<&str> = input.split_whitespace().collect();
        match args.as_slice() {
            [] => {}
            ["!help"] => {
                println!(
                    "Commands:
  !register <username> <password>   register a new account
  !login <username> <password>      log in
  !rooms                            list chatrooms
  !create <room>                    create a chatroom
  !delete <room>                    delete a chatroom you own
  !join <room>                      join a chatroom (then !leave to exit)"
                );
            }
            ["!register", username, password] => {
                let response = self.client.register_user(username, password)?;
                println!("{}", response.message);
            }
            ["!login", username, password] => {
                let response = self.client.login(username, password)?;
                if response.is_ok() {
                    self.credentials = Some((username.to_string(), password.to_string()));
                }
                println!("{}", response.message);
            }
            ["!rooms"] => {
                for chatroom in self.client.list_chatrooms()? {
                    println!("{chatroom}");
                }
            }
            ["!create", chatroom] => {
                let (username, _) = self.logged_in()?;
                let response = self.client.create_chatroom(chatroom, &username)?;
                println!("{}", response.message);
            }
            ["!delete", chatroom] => {
                let (username, password) = self.logged_in()?;
                let response = self.client.delete_chatroom(chatroom, &username, &password)?;
                println!("{}", response.message);
            }
            ["!join", chatroom] => {
                let (username, _) = self.logged_in()?;
                let response = self.client.get_chatroom(chatroom)?;
                let Some(placement) = placement_of(response) else { return Ok(()) };
                let session = self.client.join_chatroom(&placement, &username)?;
                self.chat_window(session, &username)?;
            }
            _ => println!("Unknown command, enter !help for instructions"),
        }
        Ok(())
    }

    fn logged_in(&self) -> Result<(String, String)> {
        self.credentials.clone().ok_or(Error::InvalidInput("log in first with !login".into()))
    }

    /// The chat window: prints incoming messages as they arrive and
    /// publishes input lines, one active subscription at a time. Returns to
    /// the main prompt when the user leaves or the room closes; a dropped
    /// stream triggers re-establishment and a rejoin.
    fn chat_window(&mut self, mut session: ChatSession, username: &str) -> Result<()> {
        const OPEN: u8 = 0;
        const CLOSED: u8 = 1;
        const DROPPED: u8 = 2;

        println!("Joined {}; !leave to exit.", session.chatroom());
        loop {
            let state = Arc::new(AtomicU8::new(OPEN));
            let printer = {
                let state = state.clone();
                let events = session.events().clone();
                std::thread::spawn(move || {
                    for event in events {
                        match event {
                            ChatEvent::Message(line) => println!("{line}"),
                            ChatEvent::Closed => {
                                println!("The chatroom has been deleted; no more messages may be delivered");
                                state.store(CLOSED, Ordering::Release);
                                return;
                            }
                            ChatEvent::Dropped => {
                                state.store(DROPPED, Ordering::Release);
                                return;
                            }
                        }
                    }
                })
            };

            // Read and publish lines until the session ends one way or
            // another. The state is only observed on input, which is fine
            // for an interactive prompt.
            let ended = loop {
                match state.load(Ordering::Acquire) {
                    OPEN => {}
                    ended => break ended,
                }
                match self.editor.readline(&format!("{}> ", session.chatroom())) {
                    Ok(line) if line.trim() == "!leave" => {
                        session.leave()?;
                        let _ = printer.join();
                        return Ok(());
                    }
                    Ok(line) if line.trim().is_empty() => {}
                    Ok(line) => {
                        if let Err(err) = session.chat(line.trim()) {
                            println!("Error: {err}");
                        }
                    }
                    Err(ReadlineError::Eof | ReadlineError::Interrupted) => {
                        session.leave()?;
                        let _ = printer.join();
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            let _ = printer.join();
            if ended == CLOSED {
                return Ok(());
            }

            // The stream dropped without the room closing: the chat node is
            // presumed dead. Ask the coordinator to re-establish the room
            // and rejoin it.
            println!("Connection to chatroom lost, reestablishing...");
            let chatroom = session.chatroom().to_string();
            let response = self.client.reestablish_chatroom(&chatroom, username)?;
            let Some(placement) = placement_of(response) else { return Ok(()) };
            session = self.client.join_chatroom(&placement, username)?;
            println!("Rejoined {chatroom}.");
        }
    }
}

fn placement_of(response: ChatroomResponse) -> Option<chatter::message::Placement> {
    if !response.is_ok() {
        println!("{}", response.message);
        return None;
    }
    response.placement
}
