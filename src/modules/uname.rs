//! Kernel and distribution enumeration.

use redcat_internal::error::Error;
use serde_json::json;

use crate::facts::{Fact, Schedule};
use crate::modules::{Args, EventSink, Module, TextResult};
use crate::platform::PlatformKind;
use crate::session::Session;

pub struct Uname;

impl Module for Uname {
    fn name(&self) -> &'static str {
        "enumerate.uname"
    }

    fn platforms(&self) -> &'static [PlatformKind] {
        &[PlatformKind::Linux]
    }

    fn description(&self) -> &'static str {
        "Enumerate kernel release, architecture and hostname"
    }

    fn run(&self, session: &mut Session, _args: &Args, sink: &mut dyn EventSink) -> Result<(), Error> {
        // serve from the cache when we already know it
        if let Some(fact) = session.find_fact("system.uname") {
            sink.result(Box::new(TextResult::categorized(
                fact.data["full"].as_str().unwrap_or_default().to_string(),
                "system",
            )));
            return Ok(());
        }

        sink.status("running uname");
        let out = session
            .platform
            .run(&["uname".to_string(), "-a".to_string()], None, None)?;
        if !out.success() {
            return Err(Error::NotFound("uname".into()));
        }
        let full = out.stdout_utf8().trim().to_string();

        let release = session
            .platform
            .run(&["uname".to_string(), "-r".to_string()], None, None)?
            .stdout_utf8()
            .trim()
            .to_string();

        let mut fact = Fact::new(self.name(), "system.uname", json!({
            "full": full,
            "release": release,
        }));
        fact.schedule = Schedule::Once;
        session.record_fact(fact);

        sink.result(Box::new(TextResult::categorized(full, "system")));
        Ok(())
    }
}
