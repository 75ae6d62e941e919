use crate::job::{JobId, SimulationUnit, TaskSpec};
use std::{collections::BTreeMap, path::Path};

pub const ENV_STORAGE_ACCOUNT: &str = "PARASIM_STORAGE_ACCOUNT";
pub const ENV_STORAGE_KEY: &str = "PARASIM_STORAGE_KEY";
pub const ENV_STORAGE_CONTAINER_URL: &str = "PARASIM_STORAGE_CONTAINER_URL";
pub const ENV_NUMBER_OF_PROCESSORS: &str = "NUMBER_OF_PROCESSORS";

/// Turns simulation units into remotely executable tasks.
///
/// Task ids are the zero based ordinal of the (unit, simulation) pair in encounter order. The
/// idempotent resubmission relies on this: the same input always maps onto the same ids.
#[derive(Debug, Clone)]
pub struct TaskGenerator {
    units: Vec<SimulationUnit>,
    command: String,
    account: String,
    key: String,
    cores_per_process: u32,
}

impl TaskGenerator {
    pub fn new(
        units: Vec<SimulationUnit>,
        command: impl Into<String>,
        account: impl Into<String>,
        key: impl Into<String>,
        cores_per_process: u32,
    ) -> Self {
        Self {
            units,
            command: command.into(),
            account: account.into(),
            key: key.into(),
            cores_per_process,
        }
    }

    /// number of tasks `generate` yields
    pub fn len(&self) -> usize {
        self.units.iter().map(|unit| unit.simulations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily yield one task per simulation, every call starts over from task `0`.
    ///
    /// `container_url` is the output container of the job, handed to every task so it knows
    /// where to put its results.
    pub fn generate<'a>(
        &'a self,
        job: &JobId,
        container_url: &'a str,
    ) -> impl Iterator<Item = TaskSpec> + 'a {
        let job = *job;

        self.units
            .iter()
            .flat_map(|unit| {
                unit.simulations
                    .iter()
                    .map(move |simulation| (unit.model.as_str(), simulation.as_str()))
            })
            .enumerate()
            .map(move |(index, (model, simulation))| {
                self.task(&job, index, model, simulation, container_url)
            })
    }

    fn task(
        &self,
        job: &JobId,
        index: usize,
        model: &str,
        simulation: &str,
        container_url: &str,
    ) -> TaskSpec {
        let model_stem = Path::new(model)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| model.to_owned());

        let environment = BTreeMap::from([
            (ENV_STORAGE_ACCOUNT.to_owned(), self.account.clone()),
            (ENV_STORAGE_KEY.to_owned(), self.key.clone()),
            (ENV_STORAGE_CONTAINER_URL.to_owned(), container_url.to_owned()),
            (
                ENV_NUMBER_OF_PROCESSORS.to_owned(),
                self.cores_per_process.to_string(),
            ),
            ("PARASIM_JOB_ID".to_owned(), job.to_string()),
        ]);

        TaskSpec {
            id: index.to_string(),
            display_name: format!("{simulation} ({model_stem})"),
            command: self
                .command
                .replace("{model}", &quote(model))
                .replace("{simulation}", &quote(simulation)),
            environment,
        }
    }
}

// single quote for `sh -c`, simulation names regularly contain spaces
pub(crate) fn quote(argument: &str) -> String {
    format!("'{}'", argument.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn units() -> Vec<SimulationUnit> {
        vec![
            SimulationUnit {
                model: "Wheat.apsim".into(),
                simulations: vec!["Early".into(), "Late sow".into()],
            },
            SimulationUnit {
                model: "Barley.apsim".into(),
                simulations: vec!["Barley.apsim".into()],
            },
        ]
    }

    #[test]
    pub fn ids_are_ordinals_in_encounter_order() {
        let generator = TaskGenerator::new(units(), "./runtask.sh {model} {simulation}", "lab", "key", 2);
        let job = JobId::generate();

        let tasks = generator.generate(&job, "file:///store/c").collect_vec();

        assert_eq!(generator.len(), 3);
        assert_eq!(tasks.iter().map(|task| task.id.as_str()).collect_vec(), vec!["0", "1", "2"]);
        assert_eq!(tasks[1].display_name, "Late sow (Wheat)");
        assert_eq!(tasks[1].command, "./runtask.sh 'Wheat.apsim' 'Late sow'");
        assert_eq!(tasks[2].command, "./runtask.sh 'Barley.apsim' 'Barley.apsim'");
    }

    #[test]
    pub fn generation_is_restartable_and_deterministic() {
        let generator = TaskGenerator::new(units(), "run {model}", "lab", "key", 1);
        let job = JobId::generate();

        let first = generator.generate(&job, "url").collect_vec();
        let second = generator.generate(&job, "url").collect_vec();

        assert_eq!(first, second);
    }

    #[test]
    pub fn environment_carries_storage_bindings() {
        let generator = TaskGenerator::new(units(), "run", "lab", "secret", 4);
        let job = JobId::generate();
        let url = format!("file:///store/{}", job.output_container());

        let task = generator.generate(&job, &url).next().unwrap();

        assert_eq!(task.environment[ENV_STORAGE_ACCOUNT], "lab");
        assert_eq!(task.environment[ENV_STORAGE_KEY], "secret");
        assert_eq!(task.environment[ENV_STORAGE_CONTAINER_URL], url);
        assert_eq!(task.environment[ENV_NUMBER_OF_PROCESSORS], "4");
    }

    #[test]
    pub fn quotes_are_escaped() {
        assert_eq!(quote("it's"), r"'it'\''s'");
    }
}
