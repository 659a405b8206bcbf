//! Client-side protocol state.
//!
//! A [`Session`] owns the client's key pair, its cache of other users'
//! public keys and the current chat target. It never touches sockets or the
//! terminal: every handler returns the [`Action`]s the caller should carry
//! out, which keeps the state machine testable on its own.
//!
//! Chat target transitions:
//!
//! ```text
//! Public    --!secret T (T known)-->   Secret(T)
//! Public    --!secret T (T unknown)--> Public      (reported)
//! Secret(_) --!secret U (U known)-->   Secret(U)
//! Secret(_) --!exit-->                 Public
//! Secret(T) --T leaves-->              Public      (reported)
//! ```

use std::{collections::HashMap, fmt};

use thiserror::Error;

use crate::{
    crypto::{self, CryptoError, KeyPair},
    message::{ClientToRelay, Identity, RelayToClient, is_valid_username},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("username can't be empty")]
    EmptyUsername,
    #[error("username '{0}' may only contain letters, digits and '_'")]
    InvalidUsername(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Public,
    Secret(String),
}

/// A parsed line of user input.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Secret(&'a str),
    MalformedSecret,
    Exit,
    Text(&'a str),
}

impl<'a> Command<'a> {
    /// Returns `None` for blank input.
    pub fn parse(raw: &'a str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if trimmed == "!exit" {
            return Some(Command::Exit);
        }

        if let Some(rest) = trimmed.strip_prefix("!secret") {
            if rest.is_empty() {
                return Some(Command::MalformedSecret);
            }
            if rest.starts_with(char::is_whitespace) {
                let name = rest.trim_start();
                return Some(if is_valid_username(name) {
                    Command::Secret(name)
                } else {
                    Command::MalformedSecret
                });
            }
        }

        Some(Command::Text(raw))
    }
}

/// Something the user should see.
#[derive(Debug)]
pub enum Notice {
    Roster { count: usize },
    Welcome { username: String },
    Joined { username: String },
    Left { username: String },
    Public { sender: String, text: String },
    Ciphertext { sender: String, ciphertext: String },
    Private { sender: String, text: String },
    SecretStarted { target: String },
    SecretEnded { target: String },
    NotInSecretChat,
    SecretUsage,
    UserNotFound { username: String },
    RecipientNotFound { username: String },
    EncryptionFailed(CryptoError),
    DecryptionFailed { sender: String, error: CryptoError },
    Relay { message: String },
}

impl Notice {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Notice::EncryptionFailed(_)
                | Notice::DecryptionFailed { .. }
                | Notice::RecipientNotFound { .. }
                | Notice::Relay { .. }
        )
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Roster { count } => {
                write!(f, "*** there are currently {count} users in the chat")
            }
            Notice::Welcome { username } => write!(f, "*** connected as {username}"),
            Notice::Joined { username } => write!(f, "*** {username} joined the chat"),
            Notice::Left { username } => write!(f, "*** {username} left the chat"),
            Notice::Public { sender, text } => write!(f, "<{sender}> {text}"),
            Notice::Ciphertext { sender, ciphertext } => {
                write!(f, "<{sender}> (cipher-encrypted) {ciphertext}")
            }
            Notice::Private { sender, text } => write!(f, "<{sender}> (private) {text}"),
            Notice::SecretStarted { target } => {
                write!(f, "*** now secretly chatting with {target}")
            }
            Notice::SecretEnded { target } => {
                write!(f, "*** no more secretly chatting with {target}")
            }
            Notice::NotInSecretChat => write!(f, "*** not in a secret chat"),
            Notice::SecretUsage => write!(f, "*** usage: !secret <name>"),
            Notice::UserNotFound { username } => write!(f, "*** user \"{username}\" not found"),
            Notice::RecipientNotFound { username } => {
                write!(f, "!!! user \"{username}\" is not connected")
            }
            Notice::EncryptionFailed(error) => write!(f, "!!! encryption failed: {error}"),
            Notice::DecryptionFailed { sender, error } => {
                write!(f, "!!! decryption failed for message from {sender}: {error}")
            }
            Notice::Relay { message } => write!(f, "!!! {message}"),
        }
    }
}

#[derive(Debug)]
pub enum Action {
    Send(ClientToRelay),
    Display(Notice),
}

pub struct Session {
    username: String,
    keys: KeyPair,
    known_keys: HashMap<String, String>,
    target: ChatTarget,
}

impl Session {
    pub fn new(username: &str, keys: KeyPair) -> Result<Self, SessionError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SessionError::EmptyUsername);
        }
        if !is_valid_username(username) {
            return Err(SessionError::InvalidUsername(username.to_string()));
        }

        Ok(Self {
            username: username.to_string(),
            keys,
            known_keys: HashMap::new(),
            target: ChatTarget::Public,
        })
    }

    pub fn target(&self) -> &ChatTarget {
        &self.target
    }

    pub fn knows(&self, username: &str) -> bool {
        self.known_keys.contains_key(username)
    }

    /// Known usernames, sorted.
    pub fn known_users(&self) -> Vec<&str> {
        let mut users: Vec<_> = self.known_keys.keys().map(String::as_str).collect();
        users.sort_unstable();
        users
    }

    /// The first event a client sends after connecting.
    pub fn registration(&self) -> ClientToRelay {
        ClientToRelay::RegisterPublicKey {
            username: self.username.clone(),
            public_key: self.keys.public_key(),
        }
    }

    pub fn handle_relay_message(&mut self, message: RelayToClient) -> Vec<Action> {
        match message {
            RelayToClient::Init { users } => self.on_roster_snapshot(users),
            RelayToClient::Welcome { username, users } => self.on_welcome(username, users),
            RelayToClient::NewUser {
                username,
                public_key,
            } => self.on_identity_joined(username, public_key),
            RelayToClient::UserLeft { username } => self.on_identity_left(&username),
            RelayToClient::Message {
                username,
                message,
                encrypted,
            } => self.on_public_message(username, message, encrypted),
            RelayToClient::PrivateMessage {
                username,
                target_username,
                message,
                encrypted,
            } => self.on_direct_message(username, &target_username, &message, encrypted),
            RelayToClient::RecipientNotFound { target_username } => {
                display(Notice::RecipientNotFound {
                    username: target_username,
                })
            }
            RelayToClient::Error { message } => display(Notice::Relay { message }),
        }
    }

    pub fn on_roster_snapshot(&mut self, users: Vec<Identity>) -> Vec<Action> {
        self.replace_roster(users);
        display(Notice::Roster {
            count: self.known_keys.len(),
        })
    }

    /// The relay's roster as of our registration supersedes the one sent on
    /// connect, which may have gone stale while the user picked a name.
    pub fn on_welcome(&mut self, username: String, users: Vec<Identity>) -> Vec<Action> {
        self.replace_roster(users);

        let mut actions = display(Notice::Welcome { username });
        if let ChatTarget::Secret(target) = &self.target {
            if !self.known_keys.contains_key(target) {
                let target = target.clone();
                self.target = ChatTarget::Public;
                actions.push(Action::Display(Notice::SecretEnded { target }));
            }
        }
        actions
    }

    fn replace_roster(&mut self, users: Vec<Identity>) {
        self.known_keys = users
            .into_iter()
            .filter(|identity| identity.username != self.username)
            .map(|identity| (identity.username, identity.public_key))
            .collect();
    }

    pub fn on_identity_joined(&mut self, username: String, public_key: String) -> Vec<Action> {
        self.known_keys.insert(username.clone(), public_key);
        display(Notice::Joined { username })
    }

    pub fn on_identity_left(&mut self, username: &str) -> Vec<Action> {
        if self.known_keys.remove(username).is_none() {
            return Vec::new();
        }

        let mut actions = display(Notice::Left {
            username: username.to_string(),
        });
        if self.target == ChatTarget::Secret(username.to_string()) {
            self.target = ChatTarget::Public;
            actions.push(Action::Display(Notice::SecretEnded {
                target: username.to_string(),
            }));
        }
        actions
    }

    pub fn on_user_input(&mut self, raw: &str) -> Vec<Action> {
        match Command::parse(raw) {
            None => Vec::new(),
            Some(Command::Secret(name)) => self.start_secret_chat(name),
            Some(Command::MalformedSecret) => display(Notice::SecretUsage),
            Some(Command::Exit) => self.exit_secret_chat(),
            Some(Command::Text(text)) => self.send_text(text),
        }
    }

    fn start_secret_chat(&mut self, name: &str) -> Vec<Action> {
        if self.knows(name) {
            self.target = ChatTarget::Secret(name.to_string());
            display(Notice::SecretStarted {
                target: name.to_string(),
            })
        } else {
            self.target = ChatTarget::Public;
            display(Notice::UserNotFound {
                username: name.to_string(),
            })
        }
    }

    fn exit_secret_chat(&mut self) -> Vec<Action> {
        match std::mem::replace(&mut self.target, ChatTarget::Public) {
            ChatTarget::Secret(target) => display(Notice::SecretEnded { target }),
            ChatTarget::Public => display(Notice::NotInSecretChat),
        }
    }

    fn send_text(&self, text: &str) -> Vec<Action> {
        let recipient = match &self.target {
            ChatTarget::Secret(target) => self
                .known_keys
                .get(target)
                .map(|public_key| (target, public_key)),
            ChatTarget::Public => None,
        };

        let Some((target, public_key)) = recipient else {
            return vec![Action::Send(ClientToRelay::Message {
                username: self.username.clone(),
                message: text.to_string(),
            })];
        };

        match crypto::seal(public_key, text) {
            Ok(sealed) => vec![Action::Send(ClientToRelay::PrivateMessage {
                username: self.username.clone(),
                message: sealed,
                target_username: target.clone(),
                encrypted: true,
            })],
            Err(error) => display(Notice::EncryptionFailed(error)),
        }
    }

    pub fn on_public_message(&self, sender: String, text: String, encrypted: bool) -> Vec<Action> {
        if !encrypted {
            return display(Notice::Public { sender, text });
        }

        // Broadcast ciphertext is never ours to open; only show it for
        // senders we actually know.
        if self.knows(&sender) {
            display(Notice::Ciphertext {
                sender,
                ciphertext: text,
            })
        } else {
            Vec::new()
        }
    }

    pub fn on_direct_message(
        &self,
        sender: String,
        recipient: &str,
        ciphertext: &str,
        encrypted: bool,
    ) -> Vec<Action> {
        if !encrypted || recipient != self.username {
            return Vec::new();
        }

        match self.keys.open(ciphertext) {
            Ok(text) => display(Notice::Private { sender, text }),
            Err(error) => display(Notice::DecryptionFailed { sender, error }),
        }
    }
}

fn display(notice: Notice) -> Vec<Action> {
    vec![Action::Display(notice)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_roster(name: &str, roster: &[(&str, &KeyPair)]) -> Session {
        let mut session = Session::new(name, KeyPair::generate()).expect("valid username");
        session.on_roster_snapshot(
            roster
                .iter()
                .map(|(user, keys)| Identity::new(*user, keys.public_key()))
                .collect(),
        );
        session
    }

    fn sent(actions: Vec<Action>) -> ClientToRelay {
        match actions.as_slice() {
            [Action::Send(message)] => message.clone(),
            other => panic!("expected a single send, got {other:?}"),
        }
    }

    fn shown(actions: Vec<Action>) -> String {
        match actions.as_slice() {
            [Action::Display(notice)] => notice.to_string(),
            other => panic!("expected a single notice, got {other:?}"),
        }
    }

    #[test]
    fn blank_username_never_produces_a_session() {
        assert!(matches!(
            Session::new("", KeyPair::generate()),
            Err(SessionError::EmptyUsername)
        ));
        assert!(matches!(
            Session::new(" \t ", KeyPair::generate()),
            Err(SessionError::EmptyUsername)
        ));
    }

    #[test]
    fn names_that_cannot_be_addressed_are_refused() {
        assert_eq!(
            Session::new("two words", KeyPair::generate()).err(),
            Some(SessionError::InvalidUsername("two words".into()))
        );
        assert_eq!(
            Session::new("zoë", KeyPair::generate()).err(),
            Some(SessionError::InvalidUsername("zoë".into()))
        );
    }

    #[test]
    fn registration_carries_trimmed_name_and_public_key() {
        let keys = KeyPair::generate();
        let public_key = keys.public_key();
        let session = Session::new("  alice ", keys).expect("valid username");

        assert_eq!(
            session.registration(),
            ClientToRelay::RegisterPublicKey {
                username: "alice".into(),
                public_key,
            }
        );
    }

    #[test]
    fn command_parsing() {
        assert_eq!(Command::parse("   "), None);
        assert_eq!(Command::parse("!exit"), Some(Command::Exit));
        assert_eq!(Command::parse("!secret bob"), Some(Command::Secret("bob")));
        assert_eq!(Command::parse("!secret   bob_2 "), Some(Command::Secret("bob_2")));
        assert_eq!(Command::parse("!secret"), Some(Command::MalformedSecret));
        assert_eq!(Command::parse("!secret two words"), Some(Command::MalformedSecret));
        assert_eq!(Command::parse("!secret zoë"), Some(Command::MalformedSecret));
        assert_eq!(Command::parse("!secretive"), Some(Command::Text("!secretive")));
        assert_eq!(Command::parse("hi there"), Some(Command::Text("hi there")));
    }

    #[test]
    fn roster_snapshot_replaces_cache() {
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let mut session = session_with_roster("alice", &[("bob", &bob)]);

        let notice = shown(session.on_roster_snapshot(vec![Identity::new("carol", carol.public_key())]));

        assert_eq!(notice, "*** there are currently 1 users in the chat");
        assert_eq!(session.known_users(), vec!["carol"]);
    }

    #[test]
    fn welcome_roster_replaces_stale_connect_roster() {
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let mut alice = session_with_roster("alice", &[("bob", &bob)]);

        let notice = shown(alice.handle_relay_message(RelayToClient::Welcome {
            username: "alice".into(),
            users: vec![Identity::new("carol", carol.public_key())],
        }));

        assert_eq!(notice, "*** connected as alice");
        assert_eq!(alice.known_users(), vec!["carol"]);
        assert_eq!(
            shown(alice.on_user_input("!secret carol")),
            "*** now secretly chatting with carol"
        );
    }

    #[test]
    fn secret_to_unknown_user_stays_public() {
        let mut session = session_with_roster("alice", &[]);

        assert_eq!(shown(session.on_user_input("!secret bob")), "*** user \"bob\" not found");
        assert_eq!(session.target(), &ChatTarget::Public);
    }

    #[test]
    fn secret_then_exit_switches_between_private_and_public() {
        let bob = KeyPair::generate();
        let mut alice = session_with_roster("alice", &[("bob", &bob)]);

        assert_eq!(
            shown(alice.on_user_input("!secret bob")),
            "*** now secretly chatting with bob"
        );
        let first = sent(alice.on_user_input("m"));
        assert_eq!(
            shown(alice.on_user_input("!exit")),
            "*** no more secretly chatting with bob"
        );
        let second = sent(alice.on_user_input("m2"));

        let ClientToRelay::PrivateMessage {
            message,
            target_username,
            encrypted,
            ..
        } = first
        else {
            panic!("first send should be private");
        };
        assert_eq!(target_username, "bob");
        assert!(encrypted);
        assert_eq!(bob.open(&message).expect("bob can open"), "m");

        assert_eq!(
            second,
            ClientToRelay::Message {
                username: "alice".into(),
                message: "m2".into(),
            }
        );
    }

    #[test]
    fn exit_without_target_is_reported() {
        let mut session = session_with_roster("alice", &[]);
        assert_eq!(shown(session.on_user_input("!exit")), "*** not in a secret chat");
    }

    #[test]
    fn retargeting_follows_the_same_rules() {
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let mut alice = session_with_roster("alice", &[("bob", &bob), ("carol", &carol)]);

        alice.on_user_input("!secret bob");
        alice.on_user_input("!secret carol");
        assert_eq!(alice.target(), &ChatTarget::Secret("carol".into()));

        alice.on_user_input("!secret dave");
        assert_eq!(alice.target(), &ChatTarget::Public);
    }

    #[test]
    fn target_leaving_drops_back_to_public() {
        let bob = KeyPair::generate();
        let mut alice = session_with_roster("alice", &[("bob", &bob)]);
        alice.on_user_input("!secret bob");

        let lines: Vec<String> = alice
            .on_identity_left("bob")
            .into_iter()
            .map(|action| match action {
                Action::Display(notice) => notice.to_string(),
                Action::Send(message) => panic!("unexpected send {message:?}"),
            })
            .collect();

        assert_eq!(
            lines,
            vec![
                "*** bob left the chat",
                "*** no more secretly chatting with bob"
            ]
        );
        assert_eq!(alice.target(), &ChatTarget::Public);
        assert!(matches!(
            sent(alice.on_user_input("now public")),
            ClientToRelay::Message { .. }
        ));
    }

    #[test]
    fn unknown_departure_is_silent() {
        let mut session = session_with_roster("alice", &[]);
        assert!(session.on_identity_left("ghost").is_empty());
    }

    #[test]
    fn join_updates_cache_and_is_announced() {
        let mut session = session_with_roster("alice", &[]);
        let bob = KeyPair::generate();

        assert_eq!(
            shown(session.on_identity_joined("bob".into(), bob.public_key())),
            "*** bob joined the chat"
        );
        assert!(session.knows("bob"));
    }

    #[test]
    fn blank_input_does_nothing() {
        let mut session = session_with_roster("alice", &[]);
        assert!(session.on_user_input("  \t").is_empty());
    }

    #[test]
    fn direct_message_round_trip_between_sessions() {
        let bob_keys = KeyPair::generate();
        let bob_public = bob_keys.public_key();
        let bob = Session::new("bob", bob_keys).expect("valid username");
        let mut alice = Session::new("alice", KeyPair::generate()).expect("valid username");
        alice.on_identity_joined("bob".into(), bob_public);
        alice.on_user_input("!secret bob");

        let ClientToRelay::PrivateMessage { message, .. } = sent(alice.on_user_input("hello")) else {
            panic!("expected a private message");
        };

        assert_eq!(
            shown(bob.on_direct_message("alice".into(), "bob", &message, true)),
            "<alice> (private) hello"
        );
    }

    #[test]
    fn direct_message_for_someone_else_is_ignored() {
        let carol = Session::new("carol", KeyPair::generate()).expect("valid username");
        let bob = KeyPair::generate();
        let sealed = crypto::seal(&bob.public_key(), "not for carol").expect("seal");

        assert!(carol.on_direct_message("alice".into(), "bob", &sealed, true).is_empty());
        assert!(carol.on_direct_message("alice".into(), "carol", &sealed, false).is_empty());
    }

    #[test]
    fn undecryptable_direct_message_is_reported() {
        let carol = Session::new("carol", KeyPair::generate()).expect("valid username");
        let bob = KeyPair::generate();
        let sealed = crypto::seal(&bob.public_key(), "sealed for bob").expect("seal");

        let actions = carol.on_direct_message("alice".into(), "carol", &sealed, true);
        match actions.as_slice() {
            [Action::Display(notice @ Notice::DecryptionFailed { .. })] => {
                assert!(notice.is_error());
            }
            other => panic!("expected decryption failure, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_cached_key_reports_encryption_failure() {
        let mut alice = session_with_roster("alice", &[]);
        alice.on_identity_joined("bob".into(), "not-a-key".into());
        alice.on_user_input("!secret bob");

        let actions = alice.on_user_input("hello");
        assert!(matches!(
            actions.as_slice(),
            [Action::Display(Notice::EncryptionFailed(_))]
        ));
    }

    #[test]
    fn encrypted_broadcasts_only_shown_for_known_senders() {
        let bob = KeyPair::generate();
        let carol = session_with_roster("carol", &[("alice", &bob)]);

        assert_eq!(
            shown(carol.on_public_message("alice".into(), "c2VhbGVk".into(), true)),
            "<alice> (cipher-encrypted) c2VhbGVk"
        );
        assert!(carol
            .on_public_message("mallory".into(), "c2VhbGVk".into(), true)
            .is_empty());
        assert_eq!(
            shown(carol.on_public_message("mallory".into(), "hi".into(), false)),
            "<mallory> hi"
        );
    }

    #[test]
    fn relay_events_are_dispatched() {
        let mut session = session_with_roster("alice", &[]);

        assert_eq!(
            shown(session.handle_relay_message(RelayToClient::Welcome {
                username: "alice".into(),
                users: vec![],
            })),
            "*** connected as alice"
        );
        assert_eq!(
            shown(session.handle_relay_message(RelayToClient::RecipientNotFound {
                target_username: "bob".into()
            })),
            "!!! user \"bob\" is not connected"
        );
        assert_eq!(
            shown(session.handle_relay_message(RelayToClient::Error {
                message: "relay shutting down".into()
            })),
            "!!! relay shutting down"
        );
    }
}
