//! Compiles a set of inputs into one container and its identity map.
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_deque::{Injector, Steal};
use either::Either;
use droid_shared::bytecode::MethodBody;
use droid_shared::dexfile::writer;
use droid_shared::mapfile::{IdentityMap, InputEntry, SourcePosition};
use itertools::Itertools;

use crate::backend::cache::{CacheStatistics, CompilerCache};
use crate::backend::compiler::MethodCompiler;
use crate::backend::pre_compilation::{create_optimized_ast, ConversionContext, DelegateRegistry, StopAstConversion};
use crate::backend::structure::{delegate_instance_class, MethodJob, Structure, StructureBuilder};
use crate::config::{BuildOptions, CONTAINER_FILE, MAP_FILE};
use crate::error::{BuildError, CompilerError, MethodFailure};
use crate::model::{InputAssembly, Module, NameConverter};
use crate::trees::SourceLocation;

/// File receiving the trees when the pipeline is stopped early
pub const TREES_FILE: &str = "trees.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub classes: usize,
    pub methods: usize,
    pub cache: CacheStatistics,
    /// Files written by the build
    pub outputs: Vec<PathBuf>,
}

/// A compiled body with the line table recorded for the identity map
struct CompiledMethod {
    body: MethodBody,
    positions: Vec<SourcePosition>,
}

enum Outcome {
    /// A body, or the tree of a pipeline stopped early
    Done(usize, Either<CompiledMethod, String>),
    Failed(MethodFailure),
}

/// What every worker reads while compiling
struct Shared<'a> {
    module: &'a Module,
    names: &'a NameConverter,
    delegates: &'a DelegateRegistry,
    cache: &'a CompilerCache,
    options: &'a BuildOptions,
    cancel: &'a AtomicBool,
}

impl Shared<'_> {
    fn compile(&self, job: &MethodJob) -> Result<CompiledMethod, CompilerError> {
        let context = ConversionContext::new(self.module, self.names, &job.source, self.delegates);
        let cached = self.cache.lookup(&job.key, &context);
        let mut body = match cached {
            Some(body) => body,
            None => {
                let block = create_optimized_ast(&context, StopAstConversion::None)?;
                MethodCompiler::new(&context, true).compile(&block)?
            }
        };
        body.normalize_debug_info();
        body.canonicalize_register_kinds();

        let offsets = body.offsets();
        let positions = body
            .debug_info
            .positions
            .iter()
            .filter_map(|position| {
                let index = body.position(position.instruction)?;
                Some(SourcePosition {
                    offset: offsets[index],
                    document: job.source.location.document.clone(),
                    line: position.line,
                    column: 0,
                })
            })
            .collect();
        if !self.options.debug_info {
            body.debug_info.positions.clear();
        }
        Ok(CompiledMethod { body, positions })
    }

    fn tree(&self, job: &MethodJob) -> Result<String, CompilerError> {
        let context = ConversionContext::new(self.module, self.names, &job.source, self.delegates);
        let block = create_optimized_ast(&context, self.options.stop_at)?;
        Ok(block.to_string())
    }

    fn run(&self, index: usize, job: &MethodJob) -> Outcome {
        let result = match self.options.stop_at {
            StopAstConversion::None => self.compile(job).map(Either::Left),
            _ => self.tree(job).map(Either::Right),
        };
        result.map(|done| Outcome::Done(index, done)).unwrap_or_else(|error| {
            log::debug!("{} failed: {}", job.source.display_name(), error);
            Outcome::Failed(MethodFailure::new(job.source.display_name(), &job.source.location, error))
        })
    }

    fn worker(&self, queue: &Injector<usize>, jobs: &[MethodJob]) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            match queue.steal() {
                Steal::Success(index) => outcomes.push(self.run(index, &jobs[index])),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        outcomes
    }

    /// Runs every job on the worker pool, outcomes in job order
    fn run_all(&self, jobs: &[MethodJob]) -> Result<Vec<Outcome>, BuildError> {
        let queue = Injector::new();
        for index in 0..jobs.len() {
            queue.push(index);
        }
        let workers = self.options.worker_count().min(jobs.len()).max(1);
        log::debug!("compiling {} methods on {} workers", jobs.len(), workers);

        let mut outcomes: Vec<Outcome> = std::thread::scope(|scope| {
            let handles = (0..workers)
                .map(|_| scope.spawn(|| self.worker(&queue, jobs)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });
        if self.cancel.load(Ordering::Relaxed) {
            return Err(BuildError::Cancelled);
        }
        outcomes.sort_by_key(|outcome| match outcome {
            Outcome::Done(index, _) => *index,
            Outcome::Failed(_) => usize::MAX,
        });
        Ok(outcomes)
    }
}

/// Loads every input and builds the container and identity map into the output directory
pub fn build(options: &BuildOptions) -> Result<BuildReport, BuildError> {
    build_cancellable(options, &AtomicBool::new(false))
}

/// Like [`build`], stopping between methods once `cancel` is set
pub fn build_cancellable(options: &BuildOptions, cancel: &AtomicBool) -> Result<BuildReport, BuildError> {
    let assemblies = options
        .inputs
        .iter()
        .map(|path| InputAssembly::load(path))
        .collect::<Result<Vec<_>, _>>()?;
    log::info!("loaded {} input(s)", assemblies.len());
    AssemblyCompiler::new(options, assemblies).compile(cancel)
}

pub struct AssemblyCompiler<'a> {
    options: &'a BuildOptions,
    inputs: Vec<InputEntry>,
    module: Module,
}

impl<'a> AssemblyCompiler<'a> {
    pub fn new(options: &'a BuildOptions, assemblies: Vec<InputAssembly>) -> Self {
        let inputs = assemblies
            .iter()
            .map(|assembly| InputEntry {
                name: assembly.name().to_string(),
                scope: assembly.unit.scope.clone(),
                content_hash: assembly.content_hash.clone(),
                timestamp: assembly.timestamp,
            })
            .collect();
        let module = Module::new(assemblies.into_iter().map(|assembly| assembly.unit).collect());
        AssemblyCompiler { options, inputs, module }
    }

    pub fn compile(self, cancel: &AtomicBool) -> Result<BuildReport, BuildError> {
        let options = self.options;
        let names = NameConverter::new(&self.module);
        let structure = StructureBuilder::new(&self.module, &names, &options.package)
            .build()
            .map_err(|error| BuildError::MethodFailures(vec![MethodFailure::new("<structure>", &SourceLocation::default(), error)]))?;
        let Structure { mut dex, mut map, jobs } = structure;
        map.inputs = self.inputs;

        let cache = CompilerCache::load(options.cache_mode, options.cache_dir.as_deref(), &map);
        let delegates = DelegateRegistry::new();
        let shared = Shared {
            module: &self.module,
            names: &names,
            delegates: &delegates,
            cache: &cache,
            options,
            cancel,
        };

        let mut failures = Vec::new();
        let mut compiled = Vec::new();
        let mut trees = Vec::new();
        let mut round = jobs;
        let mut all_jobs = Vec::new();
        let mut instances = HashSet::new();
        while !round.is_empty() {
            let offset = all_jobs.len();
            for outcome in shared.run_all(&round)? {
                match outcome {
                    Outcome::Done(index, Either::Left(method)) => compiled.push((offset + index, method)),
                    Outcome::Done(index, Either::Right(tree)) => trees.push((offset + index, tree)),
                    Outcome::Failed(failure) => failures.push(failure),
                }
            }
            all_jobs.append(&mut round);

            // Delegate instances requested by this round get their classes and bodies in the next one
            for instance in delegates.instances() {
                if !instances.insert(instance.class.clone()) {
                    continue;
                }
                let (class, entry, jobs) = delegate_instance_class(&instance, &self.module, &names);
                dex.classes.push(class);
                map.types.push(entry);
                round.extend(jobs);
            }
        }

        if !failures.is_empty() {
            failures.sort_by(|a: &MethodFailure, b: &MethodFailure| a.method.cmp(&b.method));
            return Err(BuildError::MethodFailures(failures));
        }
        std::fs::create_dir_all(&options.output)?;

        if options.stop_at != StopAstConversion::None {
            let mut text = String::new();
            for (index, tree) in trees {
                let _ = writeln!(text, "{}:\n{}", all_jobs[index].source.display_name(), tree);
            }
            let path = options.output.join(TREES_FILE);
            std::fs::write(&path, text)?;
            log::info!("stopped after {:?}, trees written to {}", options.stop_at, path.display());
            return Ok(BuildReport {
                classes: dex.classes.len(),
                methods: all_jobs.len(),
                cache: cache.statistics(),
                outputs: vec![path],
            });
        }

        let methods = compiled.len();
        let mut positions = HashMap::new();
        for (index, method) in compiled {
            let job = &all_jobs[index];
            let definition = dex
                .class_mut(&job.reference.owner)
                .and_then(|class| class.method_mut(&job.reference))
                .unwrap_or_else(|| unreachable!("no skeleton for {}", job.reference));
            definition.body = Some(method.body);
            positions.insert((job.key.type_scope.clone(), job.key.method_scope.clone()), method.positions);
        }
        record_positions(&mut map, positions);
        for class in dex.classes.iter_mut() {
            class.sort_members();
        }

        let bytes = writer::write(&dex)?;
        let container = options.output.join(CONTAINER_FILE);
        std::fs::write(&container, bytes)?;
        map.sort();
        let map_path = options.output.join(MAP_FILE);
        map.save(&map_path)?;

        let statistics = cache.statistics();
        if cache.is_loaded() {
            log::info!(
                "cache: {} hits, {} misses, {} fixup failures",
                statistics.hits,
                statistics.misses,
                statistics.fixup_failures
            );
        }
        log::info!("wrote {} classes and {} method bodies to {}", dex.classes.len(), methods, container.display());
        Ok(BuildReport {
            classes: dex.classes.len(),
            methods,
            cache: statistics,
            outputs: vec![container, map_path],
        })
    }
}

fn record_positions(map: &mut IdentityMap, mut positions: HashMap<(String, String), Vec<SourcePosition>>) {
    for entry in map.types.iter_mut() {
        for method in entry.methods.iter_mut() {
            if let Some(found) = positions.remove(&(entry.scope_key.clone(), method.scope_key.clone())) {
                method.positions = found;
            }
        }
    }
    if !positions.is_empty() {
        let missing = positions.keys().map(|(ty, method)| format!("{} {}", ty, method)).join(", ");
        unreachable!("compiled methods without map entries: {}", missing);
    }
}
