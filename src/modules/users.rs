//! User account enumeration for any platform.

use redcat_internal::error::Error;
use serde_json::json;

use crate::facts::{Fact, Schedule};
use crate::modules::{Args, EventSink, Module, TextResult};
use crate::session::Session;

pub struct Users;

impl Module for Users {
    fn name(&self) -> &'static str {
        "enumerate.users"
    }

    fn description(&self) -> &'static str {
        "Enumerate local user accounts"
    }

    fn run(&self, session: &mut Session, _args: &Args, sink: &mut dyn EventSink) -> Result<(), Error> {
        sink.status("enumerating user accounts");

        let users = session.users()?.to_vec();
        sink.status(&format!("found {} accounts", users.len()));

        for user in users {
            let mut fact = Fact::new(self.name(), "user.account", json!({
                "name": user.name,
                "id": user.id,
                "home": user.home,
                "shell": user.shell,
            }));
            fact.schedule = Schedule::PerUser;
            fact.user = Some(user.name.clone());
            session.record_fact(fact);

            let title = match &user.shell {
                Some(shell) => format!("{} ({}) [{}]", user.name, user.id, shell),
                None => format!("{} ({})", user.name, user.id),
            };
            sink.result(Box::new(TextResult::categorized(title, "users")));
        }

        Ok(())
    }
}
