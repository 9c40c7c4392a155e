use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::planner::{Plan, Task};

const KNOWN_TABLES: &[&str] = &[
    "build",
    "workspace",
    "destination",
    "exclude",
    "transfer",
    "repair",
];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        for key in doc.top_level_keys() {
            if !KNOWN_TABLES.contains(&key) {
                return Err(Error::msg(format!(
                    "config table '{}' is not supported; use build (metadata), workspace, destination, exclude, transfer and repair",
                    key
                )));
            }
        }
        if !doc.has_table_path("destination") {
            return Err(Error::msg(
                "clone definition has no [destination] table",
            ));
        }

        plan.add(Task {
            id: "core.init".into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(src: &str) -> ConfigDoc {
        ConfigDoc::from_value("clone.toml", toml::from_str(src).expect("toml"))
    }

    #[test]
    fn unknown_tables_are_rejected() {
        let d = doc("[destination]\nhost = \"h\"\n[hooks]\npre = \"x\"\n");
        let err = CoreModule.plan(&d, &mut Plan::default()).unwrap_err();
        assert!(err.to_string().contains("'hooks'"), "{err}");
    }

    #[test]
    fn destination_is_required() {
        let d = doc("[exclude]\nexclude_firewall = true\n");
        assert!(CoreModule.plan(&d, &mut Plan::default()).is_err());
    }
}
