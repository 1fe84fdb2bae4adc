// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Interactive path selection.

use std::{
    collections::HashMap,
    io::{BufRead, Write},
    sync::{Arc, Mutex},
};

#[cfg(test)]
use mockall::automock;

use super::{Pinned, Policy};
use crate::{
    address::IsdAsn,
    path::{Path, PathFingerprint, fingerprints},
};

/// Asks a user to choose paths.
#[cfg_attr(test, automock)]
pub trait Prompter: Send + Sync {
    /// Returns the chosen subset of `paths` to `remote`, in order of preference.
    fn prompt(&self, paths: &[Arc<Path>], remote: IsdAsn) -> Vec<Arc<Path>>;
}

/// Policy prompting for the paths to use, once per destination.
///
/// The choice is remembered and applied as a [`Pinned`] policy to all later path sets of the same
/// destination.
pub struct InteractiveSelection {
    prompter: Box<dyn Prompter>,
    choices: Mutex<HashMap<IsdAsn, Vec<PathFingerprint>>>,
}

impl InteractiveSelection {
    /// Creates a selection policy using the given prompter.
    pub fn new(prompter: Box<dyn Prompter>) -> Self {
        Self {
            prompter,
            choices: Mutex::new(HashMap::new()),
        }
    }
}

impl Policy for InteractiveSelection {
    fn filter(&self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        let Some(destination) = paths.first().map(|p| p.destination) else {
            return paths;
        };
        let mut choices = self.choices.lock().expect("lock poisoned");
        let choice = choices
            .entry(destination)
            .or_insert_with(|| fingerprints(&self.prompter.prompt(&paths, destination)));
        Pinned(choice.clone()).filter(paths)
    }
}

// Only one prompt is shown at a time.
static PROMPT_LOCK: Mutex<()> = Mutex::new(());

/// Prompts on the terminal, reading the choice from stdin.
///
/// The choice is a whitespace separated list of path indices and inclusive index ranges, e.g.
/// `0 2-4`. Invalid input is reported and the prompt is repeated. If stdin is closed, no path is
/// chosen.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLinePrompter;

impl CommandLinePrompter {
    fn prompt_with(
        &self,
        paths: &[Arc<Path>],
        remote: IsdAsn,
        mut input: impl BufRead,
        mut output: impl Write,
    ) -> std::io::Result<Vec<Arc<Path>>> {
        writeln!(output, "Paths to {remote}")?;
        for (i, path) in paths.iter().enumerate() {
            writeln!(output, "[{i:2}] {path}")?;
        }

        let max = paths.len().saturating_sub(1);
        let mut line = String::new();
        loop {
            write!(output, "Choose path: ")?;
            output.flush()?;
            line.clear();
            if input.read_line(&mut line)? == 0 {
                return Ok(vec![]);
            }
            match parse_path_choice(&line, max) {
                Ok(indices) => return Ok(indices.into_iter().map(|i| paths[i].clone()).collect()),
                Err(e) => writeln!(output, "ERROR: Invalid path selection. {e}")?,
            }
        }
    }
}

impl Prompter for CommandLinePrompter {
    fn prompt(&self, paths: &[Arc<Path>], remote: IsdAsn) -> Vec<Arc<Path>> {
        if paths.is_empty() {
            return vec![];
        }
        let _guard = PROMPT_LOCK.lock().expect("lock poisoned");
        self.prompt_with(paths, remote, std::io::stdin().lock(), std::io::stdout())
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Path prompt failed");
                vec![]
            })
    }
}

/// Error returned for an invalid path choice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathChoiceError {
    /// A range is not of the form `a-b`.
    #[error("invalid path range choice: '{0}'")]
    InvalidRange(String),
    /// An index is not a number.
    #[error("invalid choice: '{0}'")]
    InvalidIndex(String),
    /// An index is out of range.
    #[error("invalid choice: '{index}', valid indices range: [0, {max}]")]
    OutOfRange {
        /// The chosen index.
        index: String,
        /// The largest valid index.
        max: usize,
    },
    /// Nothing was chosen.
    #[error("no path selected: '{0}'")]
    Empty(String),
}

/// Parses a choice of path indices, each at most `max`.
///
/// Indices are returned in the order they are given. Ranges `a-b` are inclusive.
pub fn parse_path_choice(selection: &str, max: usize) -> Result<Vec<usize>, PathChoiceError> {
    let mut indices = Vec::new();
    for word in selection.split_whitespace() {
        match word.split_once('-') {
            Some((start, end)) => {
                if start.is_empty() || end.is_empty() || end.contains('-') {
                    return Err(PathChoiceError::InvalidRange(word.to_string()));
                }
                let (start, end) = (parse_index(start, max)?, parse_index(end, max)?);
                indices.extend(start..=end);
            }
            None => indices.push(parse_index(word, max)?),
        }
    }
    if indices.is_empty() {
        return Err(PathChoiceError::Empty(selection.trim().to_string()));
    }
    Ok(indices)
}

fn parse_index(index: &str, max: usize) -> Result<usize, PathChoiceError> {
    let parsed: usize = index
        .parse()
        .map_err(|_| PathChoiceError::InvalidIndex(index.to_string()))?;
    if parsed > max {
        return Err(PathChoiceError::OutOfRange {
            index: index.to_string(),
            max,
        });
    }
    Ok(parsed)
}
