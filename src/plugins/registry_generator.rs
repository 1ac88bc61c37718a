// Registry generator: turns the ordered chunk graph into loadable artifacts

use crate::core::models::{Artifact, Chunk, ChunkKind, Contents, File};
use crate::core::plugin::{Component, ComponentContext, ComponentHook, GenerateHook, Outcome};
use crate::runtime::{live_update_client_source, module_loader_source};
use crate::utils::{KilnError, Logger, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sourcemap::{SourceMap, SourceMapBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::Arc;

pub const REGISTRY_GENERATOR: &str = "registry-generator";

/// Formats that end up inside a chunk's script artifact
const SCRIPT_FORMATS: &[&str] = &["script", "json"];
const STYLE_FORMAT: &str = "style";

/// Emits per chunk one artifact per format:
/// - scripts become `register(...)` calls for the module loader, with the
///   loader prelude embedded in entry chunks
/// - styles are concatenated
/// - static files are copied as they are
pub struct RegistryGenerator {
    source_maps: bool,
}

impl RegistryGenerator {
    pub fn new(source_maps: bool) -> Self {
        Self { source_maps }
    }

    pub fn into_component(self) -> Component {
        Component::new(REGISTRY_GENERATOR, env!("CARGO_PKG_VERSION"), ComponentHook::Generate(Arc::new(self)))
            .with_priority(100)
            .with_default_options(json!({
                "publicPath": "",
                "liveUpdateUrl": null,
            }))
    }

    fn generate_all(
        &self,
        chunks: &[Chunk],
        files: &BTreeMap<PathBuf, File>,
        ctx: &ComponentContext,
    ) -> Result<Vec<Artifact>> {
        let options = GeneratorOptions::from_context(ctx);
        let script_chunks = script_chunks(chunks, files);

        // dynamic import target -> chunk seeded by it
        let async_seeds: BTreeMap<&Path, &str> = chunks
            .iter()
            .filter(|chunk| chunk.kind == ChunkKind::Async)
            .filter_map(|chunk| chunk.entry.as_deref().map(|entry| (entry, chunk.id.as_str())))
            .collect();

        let mut artifacts = Vec::new();
        let mut copied = BTreeSet::new();

        for chunk in chunks {
            if script_chunks.contains(chunk.id.as_str()) {
                let manifest = (chunk.kind == ChunkKind::Entry).then(|| chunk_manifest(chunks, &script_chunks, &options));
                let imports: Vec<&str> = chunk
                    .imports
                    .iter()
                    .map(String::as_str)
                    .filter(|id| script_chunks.contains(id))
                    .collect();
                artifacts.push(self.script_artifact(chunk, files, &imports, &async_seeds, manifest, &options, ctx)?);
            }

            if has_format(chunk, files, &[STYLE_FORMAT]) {
                artifacts.push(self.style_artifact(chunk, files, ctx)?);
            }

            for file in members(chunk, files) {
                if is_static(&file.format) && copied.insert(file.path.clone()) {
                    artifacts.push(Artifact {
                        path: asset_path(file),
                        chunk: Some(chunk.id.clone()),
                        format: file.format.clone(),
                        contents: file.contents.clone(),
                        source_map: None,
                    });
                }
            }
        }

        Logger::debug(&format!("Generated {} artifacts for {} chunks", artifacts.len(), chunks.len()));
        Ok(artifacts)
    }

    #[allow(clippy::too_many_arguments)]
    fn script_artifact(
        &self,
        chunk: &Chunk,
        files: &BTreeMap<PathBuf, File>,
        imports: &[&str],
        async_seeds: &BTreeMap<&Path, &str>,
        manifest: Option<Value>,
        options: &GeneratorOptions,
        ctx: &ComponentContext,
    ) -> Result<Artifact> {
        let file_name = format!("{}.js", chunk.id);
        let mut writer = ChunkWriter::new(&file_name, self.source_maps);

        if let Some(manifest) = manifest {
            writer.push_lines(module_loader_source().trim());
            if let Some(url) = &options.live_update_url {
                writer.push_lines(live_update_client_source(url).trim());
            }
            writer.push_lines(&format!("__kiln.manifest({});", manifest));
        }

        for file in members(chunk, files) {
            let id = module_id(&ctx.root, &file.path);
            let (deps, async_deps) = dependency_maps(file, &ctx.root, async_seeds);
            writer.push_lines(&format!(
                "__kiln.register({}, function (require, module, exports, importAsync) {{",
                quote(&id)
            ));

            match file.format.as_str() {
                "script" => writer.push_source(&id, &file.contents, file.source_map.as_deref()),
                "json" => {
                    writer.push_lines("module.exports = ");
                    writer.push_source(&id, &file.contents, None);
                    writer.push_lines(";");
                }
                STYLE_FORMAT => {}
                _ => writer.push_lines(&format!(
                    "module.exports = {};",
                    quote(&format!("{}{}", options.public_path, asset_path(file).display()))
                )),
            }

            writer.push_lines(&format!("}}, {}, {});", deps, async_deps));
        }

        writer.push_lines(&format!("__kiln.chunkLoaded({});", quote(&chunk.id)));

        if chunk.kind == ChunkKind::Entry {
            if let Some(entry) = &chunk.entry {
                writer.push_lines(&format!(
                    "__kiln.loadChunks({}).then(function () {{ __kiln.require(null, {}); }});",
                    json!(imports),
                    quote(&module_id(&ctx.root, entry))
                ));
            }
        }

        writer.finish(chunk, "script")
    }

    fn style_artifact(&self, chunk: &Chunk, files: &BTreeMap<PathBuf, File>, ctx: &ComponentContext) -> Result<Artifact> {
        let file_name = format!("{}.css", chunk.id);
        let mut writer = ChunkWriter::new(&file_name, self.source_maps);

        for file in members(chunk, files).filter(|file| file.format == STYLE_FORMAT) {
            let id = module_id(&ctx.root, &file.path);
            writer.push_lines(&format!("/* {} */", id));
            writer.push_source(&id, &file.contents, file.source_map.as_deref());
        }

        writer.finish(chunk, STYLE_FORMAT)
    }
}

#[async_trait]
impl GenerateHook for RegistryGenerator {
    async fn generate(
        &self,
        chunks: &[Chunk],
        files: &BTreeMap<PathBuf, File>,
        ctx: &ComponentContext,
    ) -> Outcome<Vec<Artifact>> {
        match self.generate_all(chunks, files, ctx) {
            Ok(artifacts) => Outcome::Handled(artifacts),
            Err(err) => Outcome::Failed(err),
        }
    }
}

struct GeneratorOptions {
    public_path: String,
    live_update_url: Option<String>,
}

impl GeneratorOptions {
    fn from_context(ctx: &ComponentContext) -> Self {
        Self {
            public_path: ctx.options["publicPath"].as_str().unwrap_or_default().to_string(),
            live_update_url: ctx.options["liveUpdateUrl"].as_str().map(str::to_string),
        }
    }
}

/// Accumulates chunk text line by line and, when enabled, a source map that
/// points every member line back at its file
struct ChunkWriter {
    file_name: String,
    code: String,
    line: u32,
    builder: Option<SourceMapBuilder>,
}

impl ChunkWriter {
    fn new(file_name: &str, source_maps: bool) -> Self {
        Self {
            file_name: file_name.to_string(),
            code: String::new(),
            line: 0,
            builder: source_maps.then(|| SourceMapBuilder::new(Some(file_name))),
        }
    }

    fn push_lines(&mut self, text: &str) {
        self.code.push_str(text);
        self.code.push('\n');
        self.line += text.matches('\n').count() as u32 + 1;
    }

    fn push_source(&mut self, id: &str, contents: &Contents, source_map: Option<&str>) {
        let text = match contents {
            Contents::Text(text) => text.clone(),
            Contents::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        };
        let start = self.line;

        if let Some(builder) = self.builder.as_mut() {
            match source_map.and_then(|map| SourceMap::from_slice(map.as_bytes()).ok()) {
                Some(map) => remap(builder, &map, start),
                None => {
                    let source_id = builder.add_source(id);
                    builder.set_source_contents(source_id, Some(text.as_str()));
                    for index in 0..text.lines().count() as u32 {
                        builder.add_raw(start + index, 0, index, 0, Some(source_id), None, false);
                    }
                }
            }
        }

        self.push_lines(text.trim_end_matches('\n'));
    }

    fn finish(mut self, chunk: &Chunk, format: &str) -> Result<Artifact> {
        let source_map = match self.builder.take() {
            Some(builder) => {
                let mut bytes = Vec::new();
                builder
                    .into_sourcemap()
                    .to_writer(&mut bytes)
                    .map_err(|err| KilnError::build(format!("Source map error for {}: {}", chunk.id, err)))?;
                // maps are written next to their artifact
                let map_name = Path::new(&self.file_name)
                    .file_name()
                    .map(|name| format!("{}.map", name.to_string_lossy()))
                    .unwrap_or_default();
                let comment = match format {
                    STYLE_FORMAT => format!("/*# sourceMappingURL={} */", map_name),
                    _ => format!("//# sourceMappingURL={}", map_name),
                };
                self.push_lines(&comment);
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            None => None,
        };

        Ok(Artifact {
            path: PathBuf::from(&self.file_name),
            chunk: Some(chunk.id.clone()),
            format: format.to_string(),
            contents: Contents::Text(self.code),
            source_map,
        })
    }
}

/// Copy a member's own map into the chunk map, shifted by its line offset
fn remap(builder: &mut SourceMapBuilder, map: &SourceMap, line_offset: u32) {
    let sources: Vec<u32> = map
        .sources()
        .enumerate()
        .map(|(index, source)| {
            let id = builder.add_source(source);
            builder.set_source_contents(id, map.get_source_contents(index as u32));
            id
        })
        .collect();
    let names: Vec<u32> = map.names().map(|name| builder.add_name(name)).collect();

    for token in map.tokens() {
        builder.add_raw(
            token.get_dst_line() + line_offset,
            token.get_dst_col(),
            token.get_src_line(),
            token.get_src_col(),
            sources.get(token.get_src_id() as usize).copied(),
            names.get(token.get_name_id() as usize).copied(),
            false,
        );
    }
}

/// id -> { url, imports } for every chunk that emits a script
fn chunk_manifest(chunks: &[Chunk], script_chunks: &BTreeSet<&str>, options: &GeneratorOptions) -> Value {
    let mut entries = Map::new();
    for chunk in chunks.iter().filter(|chunk| script_chunks.contains(chunk.id.as_str())) {
        let imports: Vec<&str> = chunk
            .imports
            .iter()
            .map(String::as_str)
            .filter(|id| script_chunks.contains(id))
            .collect();
        entries.insert(
            chunk.id.clone(),
            json!({ "url": format!("{}{}.js", options.public_path, chunk.id), "imports": imports }),
        );
    }
    Value::Object(entries)
}

/// request -> module id for every resolved import, and request -> chunk id
/// for dynamic ones
fn dependency_maps(file: &File, root: &Path, async_seeds: &BTreeMap<&Path, &str>) -> (Value, Value) {
    let mut deps = Map::new();
    let mut async_deps = Map::new();

    for import in &file.imports {
        let Some(target) = import.resolved_path.as_deref() else {
            continue;
        };
        deps.insert(import.request.clone(), Value::String(module_id(root, target)));
        if let Some(chunk) = async_seeds.get(target) {
            async_deps.insert(import.request.clone(), Value::String(chunk.to_string()));
        }
    }
    (Value::Object(deps), Value::Object(async_deps))
}

fn members<'a>(chunk: &'a Chunk, files: &'a BTreeMap<PathBuf, File>) -> impl Iterator<Item = &'a File> + 'a {
    chunk.files.iter().filter_map(move |path| files.get(path))
}

/// Chunks that get a `.js` artifact: those with script members, every async
/// chunk (the loader fetches it by id even after shared extraction emptied
/// it) and every chunk importing one of those
fn script_chunks<'a>(chunks: &'a [Chunk], files: &BTreeMap<PathBuf, File>) -> BTreeSet<&'a str> {
    let mut selected: BTreeSet<&str> = chunks
        .iter()
        .filter(|chunk| chunk.kind == ChunkKind::Async || has_format(chunk, files, SCRIPT_FORMATS))
        .map(|chunk| chunk.id.as_str())
        .collect();

    loop {
        let before = selected.len();
        for chunk in chunks {
            if chunk.imports.iter().any(|id| selected.contains(id.as_str())) {
                selected.insert(chunk.id.as_str());
            }
        }
        if selected.len() == before {
            return selected;
        }
    }
}

fn has_format(chunk: &Chunk, files: &BTreeMap<PathBuf, File>, formats: &[&str]) -> bool {
    members(chunk, files).any(|file| formats.contains(&file.format.as_str()))
}

fn asset_path(file: &File) -> PathBuf {
    let name = file.path.file_name().map(PathBuf::from).unwrap_or_else(|| file.path.clone());
    Path::new("assets").join(name)
}

fn is_static(format: &str) -> bool {
    !SCRIPT_FORMATS.contains(&format) && format != STYLE_FORMAT
}

/// Root-relative, `/`-separated path used as the runtime registry key
pub fn module_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|component| match component {
            PathComponent::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn quote(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}
