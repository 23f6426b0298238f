//! The command registry and its factory.
//!
//! The factory owns the registry: every command currently loaded,
//! keyed by name and by synonym, behind a readers-writer lock. Scans
//! walk the search path for `*.cmd` files newer than the last scan
//! mark, reparse them (plus the embedded built-ins), and commit the
//! union: unchanged commands survive, commands whose file was
//! reparsed are replaced or dropped, and a name collision between two
//! files aborts the whole scan with the previous registry intact.
//!
//! Shells built by the factory subscribe to rebuilds through a shared
//! staleness flag; each one swaps in a freshly filtered table on its
//! next input after a rebuild.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::command::handlers::HandlerRegistry;
use crate::command::parser::CommandParser;
use crate::command::table::CommandTable;
use crate::command::Command;
use crate::errors::{OutpostError, OutpostResult};
use crate::filters::shell::ShellFilter;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::sessions::SessionRegistry;
use crate::users::User;

/// Command definitions embedded with the factory.
const BUILTIN_SOURCE: &str = include_str!("builtins.cmd");

/// Parameters handed to every shell the factory builds.
#[derive(Debug, Clone)]
pub struct ShellParams {
    pub command_prefix: char,
    pub default_prompt: String,
}

impl Default for ShellParams {
    fn default() -> Self {
        Self {
            command_prefix: '/',
            default_prompt: "outpost> ".to_string(),
        }
    }
}

pub struct CommandFactory {
    search_path: Vec<PathBuf>,
    params: ShellParams,
    parser: CommandParser,
    handlers: HandlerRegistry,
    sessions: Arc<SessionRegistry>,
    registry: RwLock<HashMap<String, Arc<Command>>>,
    last_scan: Mutex<Option<SystemTime>>,
    observers: Mutex<Vec<Weak<AtomicBool>>>,
    reload_timer: Mutex<Option<TimerHandle>>,
}

impl CommandFactory {
    /// Build the factory and run the initial scan.
    pub fn new(
        search_path: Vec<PathBuf>,
        params: ShellParams,
        sessions: Arc<SessionRegistry>,
    ) -> OutpostResult<Arc<Self>> {
        let factory = Arc::new(Self {
            search_path,
            params,
            parser: CommandParser::new(),
            handlers: HandlerRegistry::builtin(),
            sessions,
            registry: RwLock::new(HashMap::new()),
            last_scan: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            reload_timer: Mutex::new(None),
        });
        factory.rebuild()?;
        Ok(factory)
    }

    /// Rescan changed command files and commit the union. Returns the
    /// number of distinct commands in the registry afterwards. On any
    /// error the previous registry is kept.
    pub fn rebuild(&self) -> OutpostResult<usize> {
        let mark = *self.last_scan.lock().unwrap();
        let files = self.collect_command_files();

        let changed: Vec<&(PathBuf, SystemTime)> = files
            .iter()
            .filter(|(_, mtime)| mark.is_none_or(|mark| *mtime > mark))
            .collect();

        // Built-ins are reparsed on every scan; they are the one
        // source with no mtime.
        let builtin_path = Path::new("<builtin>");
        let mut parsed: Vec<(PathBuf, Vec<crate::command::ParsedCommand>)> = vec![(
            builtin_path.to_path_buf(),
            self.parser.parse_str(BUILTIN_SOURCE, builtin_path)?,
        )];
        for (path, _) in &changed {
            debug!(file = %path.display(), "parsing command file");
            parsed.push((path.clone(), self.parser.parse_file(path)?));
        }

        let reparsed: HashSet<&Path> = parsed.iter().map(|(p, _)| p.as_path()).collect();
        let surviving_files: HashSet<&Path> = files.iter().map(|(p, _)| p.as_path()).collect();

        // Keep commands from files that were neither reparsed nor
        // deleted out from under us.
        let mut candidate: HashMap<String, Arc<Command>> = HashMap::new();
        for command in self.registry.read().unwrap().values() {
            let source = command.source_file.as_path();
            if reparsed.contains(source) {
                continue;
            }
            if source != builtin_path && !surviving_files.contains(source) {
                info!(
                    command = %command.name,
                    file = %source.display(),
                    "source file removed; dropping command"
                );
                continue;
            }
            candidate.insert(command.name.clone(), command.clone());
        }

        // Compile and add the reparsed commands.
        for (_path, commands) in parsed {
            for parsed_command in commands {
                let body = self.handlers.compile(&parsed_command.body_source).ok_or(
                    OutpostError::CommandParse {
                        file: parsed_command.source_file.clone(),
                        line: parsed_command.source_line,
                        message: format!(
                            "body of '{}' names no registered handler",
                            parsed_command.name
                        ),
                    },
                )?;
                let command = Arc::new(Command::new(parsed_command, body));
                if let Some(existing) = candidate.get(&command.name)
                    && existing.source_file != command.source_file
                {
                    return Err(OutpostError::CommandNameConflict {
                        name: command.name.clone(),
                        first: existing.source_file.clone(),
                        second: command.source_file.clone(),
                    });
                }
                candidate.insert(command.name.clone(), command);
            }
        }

        // Expand to the keyed map, catching synonym collisions.
        let mut keyed: HashMap<String, Arc<Command>> = HashMap::new();
        for command in candidate.values() {
            for key in command.keys() {
                if let Some(existing) = keyed.get(key)
                    && existing.name != command.name
                {
                    return Err(OutpostError::CommandNameConflict {
                        name: key.to_string(),
                        first: existing.source_file.clone(),
                        second: command.source_file.clone(),
                    });
                }
                keyed.insert(key.to_string(), command.clone());
            }
        }

        let count = candidate.len();
        *self.registry.write().unwrap() = keyed;

        let newest = files.iter().map(|(_, mtime)| *mtime).max();
        let mut mark = self.last_scan.lock().unwrap();
        *mark = match (*mark, newest) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        drop(mark);

        info!(commands = count, "command registry rebuilt");
        self.notify_observers();
        Ok(count)
    }

    /// Regular files under the search path named `*.cmd`, hidden
    /// entries skipped, with their modification times.
    fn collect_command_files(&self) -> Vec<(PathBuf, SystemTime)> {
        let mut files = Vec::new();
        for root in &self.search_path {
            collect_into(root, &mut files);
        }
        files.sort();
        files
    }

    fn notify_observers(&self) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|weak| match weak.upgrade() {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        });
    }

    /// Rescan every `reload_interval` until the handle is dropped.
    pub fn start_auto_reload(self: &Arc<Self>, scheduler: &Scheduler, interval: Duration) {
        let factory = Arc::downgrade(self);
        let timer = scheduler.schedule_every(interval, move || {
            if let Some(factory) = factory.upgrade()
                && let Err(e) = factory.rebuild()
            {
                warn!("scheduled command rebuild failed: {}", e);
            }
        });
        *self.reload_timer.lock().unwrap() = Some(timer);
    }

    pub fn stop_auto_reload(&self) {
        if let Some(timer) = self.reload_timer.lock().unwrap().take() {
            timer.cancel();
        }
    }

    /// Look a command up by name or synonym.
    pub fn command(&self, key: &str) -> Option<Arc<Command>> {
        self.registry.read().unwrap().get(key).cloned()
    }

    /// The commands a user's account type admits, sorted by name.
    pub fn commands_available_to(&self, user: &User) -> Vec<Arc<Command>> {
        let registry = self.registry.read().unwrap();
        let mut seen = HashSet::new();
        let mut commands: Vec<Arc<Command>> = registry
            .values()
            .filter(|command| command.restriction <= user.account_type)
            .filter(|command| seen.insert(command.name.clone()))
            .cloned()
            .collect();
        commands.sort_by(|a, b| a.name.cmp(&b.name));
        commands
    }

    pub fn create_command_table_for_user(&self, user: &User) -> CommandTable {
        CommandTable::new(self.commands_available_to(user))
    }

    /// Build a shell over the user's table and subscribe it to future
    /// rebuilds.
    pub fn create_shell_for_user(self: &Arc<Self>, user: Arc<User>) -> ShellFilter {
        let table = self.create_command_table_for_user(&user);
        let stale = Arc::new(AtomicBool::new(false));
        self.observers
            .lock()
            .unwrap()
            .push(Arc::downgrade(&stale));
        ShellFilter::new(
            user,
            table,
            self.params.command_prefix,
            self.params.default_prompt.clone(),
            Arc::downgrade(self),
            stale,
            self.sessions.clone(),
        )
    }

    #[cfg(test)]
    pub(crate) fn reset_scan_mark(&self) {
        *self.last_scan.lock().unwrap() = None;
    }
}

impl Drop for CommandFactory {
    fn drop(&mut self) {
        self.stop_auto_reload();
    }
}

fn collect_into(dir: &Path, files: &mut Vec<(PathBuf, SystemTime)>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "cannot read command directory: {}", e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        if hidden {
            continue;
        }

        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect_into(&path, files);
        } else if file_type.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some("cmd")
            && let Ok(metadata) = entry.metadata()
            && let Ok(mtime) = metadata.modified()
        {
            files.push((path, mtime));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::AccountType;
    use std::fs;
    use tempfile::TempDir;

    fn factory_over(dir: &TempDir) -> Arc<CommandFactory> {
        CommandFactory::new(
            vec![dir.path().to_path_buf()],
            ShellParams::default(),
            Arc::new(SessionRegistry::new()),
        )
        .unwrap()
    }

    fn user(account_type: AccountType) -> User {
        User::new("tester".to_string(), "pw", account_type).unwrap()
    }

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn initial_scan_loads_builtins_and_files() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "local.cmd",
            "= wave\n== abstract\n  Wave around.\n== code\n  echo\n  %u waves.\n",
        );

        let factory = factory_over(&dir);
        assert!(factory.command("help").is_some());
        assert!(factory.command("wave").is_some());
        // Synonym keys resolve too.
        assert_eq!(factory.command("logout").unwrap().name, "quit");
    }

    #[test]
    fn restriction_filters_per_user_tables() {
        let dir = TempDir::new().unwrap();
        let factory = factory_over(&dir);

        let plain = user(AccountType::User);
        let admin = user(AccountType::Admin);

        let plain_cmds = factory.commands_available_to(&plain);
        assert!(plain_cmds.iter().any(|c| c.name == "who"));
        assert!(!plain_cmds.iter().any(|c| c.name == "shutdown"));
        assert!(!plain_cmds.iter().any(|c| c.name == "snoop"));

        let admin_cmds = factory.commands_available_to(&admin);
        assert!(admin_cmds.iter().any(|c| c.name == "shutdown"));
        // Everything admissible to a user is admissible to an admin.
        for command in &plain_cmds {
            assert!(
                admin_cmds
                    .iter()
                    .any(|c| c.name == command.name && c.restriction <= AccountType::Admin)
            );
        }
    }

    #[test]
    fn reload_replaces_and_removes_per_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.cmd", "= foo\n== code\n  echo\n  foo!\n");

        let factory = factory_over(&dir);
        assert!(factory.command("foo").is_some());
        assert!(factory.command("bar").is_none());

        // Edit the file: foo disappears, bar appears.
        write(&dir, "a.cmd", "= bar\n== code\n  echo\n  bar!\n");
        factory.reset_scan_mark();
        factory.rebuild().unwrap();

        assert!(factory.command("foo").is_none());
        assert!(factory.command("bar").is_some());
    }

    #[test]
    fn deleting_a_file_drops_its_commands() {
        let dir = TempDir::new().unwrap();
        write(&dir, "gone.cmd", "= doomed\n== code\n  echo\n  hi\n");

        let factory = factory_over(&dir);
        assert!(factory.command("doomed").is_some());

        fs::remove_file(dir.path().join("gone.cmd")).unwrap();
        factory.rebuild().unwrap();
        assert!(factory.command("doomed").is_none());
    }

    #[test]
    fn name_conflicts_abort_and_keep_previous_registry() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.cmd", "= dup\n== code\n  echo\n  from a\n");

        let factory = factory_over(&dir);
        assert!(factory.command("dup").is_some());
        let before = factory.commands_available_to(&user(AccountType::Admin)).len();

        write(&dir, "b.cmd", "= dup\n== code\n  echo\n  from b\n");
        factory.reset_scan_mark();
        let err = factory.rebuild().unwrap_err();
        assert!(matches!(err, OutpostError::CommandNameConflict { .. }));

        // Previous registry intact.
        assert!(factory.command("dup").is_some());
        assert_eq!(
            factory.commands_available_to(&user(AccountType::Admin)).len(),
            before
        );
    }

    #[test]
    fn unknown_handler_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, "bad.cmd", "= zap\n== code\n  transmogrify\n");

        let result = CommandFactory::new(
            vec![dir.path().to_path_buf()],
            ShellParams::default(),
            Arc::new(SessionRegistry::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn rebuild_raises_observer_flags() {
        let dir = TempDir::new().unwrap();
        let factory = factory_over(&dir);

        let shell = factory.create_shell_for_user(Arc::new(user(AccountType::User)));
        let flag = shell.stale_flag();
        assert!(!flag.load(Ordering::SeqCst));

        factory.rebuild().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn hidden_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        write(&dir, ".hidden.cmd", "= sneaky\n== code\n  echo\n  boo\n");
        let factory = factory_over(&dir);
        assert!(factory.command("sneaky").is_none());
    }
}
