//! Template loading and the process-wide template cache

use super::{ScaleRange, Template, TemplateDescriptor, TemplateKind};
use image::GrayImage;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Errors raised while loading templates
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("template '{name}' references missing file {path:?}")]
    MissingFile { name: String, path: PathBuf },
    #[error("no image found for template '{0}' in the template directories")]
    Unresolved(String),
    #[error("failed to decode template '{name}' from {path:?}")]
    Decode {
        name: String,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to read template directory {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template '{0}' is not loaded")]
    NotFound(String),
}

impl StoreError {
    /// True for asset problems (unreadable or missing images) as opposed to
    /// lookups of names that were never loaded.
    pub fn is_asset_error(&self) -> bool {
        !matches!(self, StoreError::NotFound(_))
    }
}

/// The templates active for one session, split by kind.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    pub content: Vec<Arc<Template>>,
    pub start_marker: Option<Arc<Template>>,
    pub end_marker: Option<Arc<Template>>,
}

impl TemplateSet {
    pub fn len(&self) -> usize {
        self.content.len()
            + self.start_marker.is_some() as usize
            + self.end_marker.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every template in the set, content first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Template>> {
        self.content
            .iter()
            .chain(self.start_marker.iter())
            .chain(self.end_marker.iter())
    }
}

/// Template store with multiple search strategies.
///
/// Shared between sessions behind an `Arc`; decoded images stay cached until
/// the store is dropped, scale pyramids until [`TemplateStore::invalidate`].
#[derive(Debug)]
pub struct TemplateStore {
    template_dirs: Vec<PathBuf>,
    supported_extensions: Vec<String>,
    templates: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateStore {
    /// Create new template store
    pub fn new() -> Self {
        Self {
            template_dirs: Vec::new(),
            supported_extensions: vec![
                "png".to_string(),
                "jpg".to_string(),
                "jpeg".to_string(),
                "bmp".to_string(),
            ],
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Add template directory
    pub fn add_template_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.template_dirs.push(dir.as_ref().to_path_buf());
        self
    }

    /// Register an already decoded image under `descriptor.name`.
    pub fn insert(&self, descriptor: TemplateDescriptor, image: GrayImage) -> Arc<Template> {
        let template = Arc::new(Template::new(descriptor, image));
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(template.name().to_string(), Arc::clone(&template));
        template
    }

    /// Load every enabled descriptor and group the result by kind.
    ///
    /// Images already held under the same name are reused; anything else is
    /// decoded from the descriptor's path or found by name in the template
    /// directories.
    pub fn load(&self, descriptors: &[TemplateDescriptor]) -> Result<TemplateSet, StoreError> {
        self.load_in(descriptors, &[])
    }

    /// Like [`TemplateStore::load`], also searching `extra_dirs` after the
    /// store's own directories.
    pub fn load_in(
        &self,
        descriptors: &[TemplateDescriptor],
        extra_dirs: &[PathBuf],
    ) -> Result<TemplateSet, StoreError> {
        let mut set = TemplateSet::default();

        for descriptor in descriptors.iter().filter(|d| d.enabled) {
            let template = self.load_one(descriptor, extra_dirs)?;

            match descriptor.kind {
                TemplateKind::Content => set.content.push(template),
                TemplateKind::StartMarker => set.start_marker = Some(template),
                TemplateKind::EndMarker => set.end_marker = Some(template),
            }
        }

        log::info!(
            "loaded {} templates ({} content)",
            set.len(),
            set.content.len()
        );
        Ok(set)
    }

    fn load_one(
        &self,
        descriptor: &TemplateDescriptor,
        extra_dirs: &[PathBuf],
    ) -> Result<Arc<Template>, StoreError> {
        let cached = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&descriptor.name)
            .cloned();

        let template = match cached {
            Some(existing) if existing.descriptor() == descriptor => return Ok(existing),
            Some(existing) => Template::from_shared(descriptor.clone(), existing.shared_image()),
            None => {
                let path = self.resolve_path(descriptor, extra_dirs)?;
                let image = decode_grayscale(&descriptor.name, &path)?;
                log::debug!(
                    "decoded template '{}' ({}x{}) from {:?}",
                    descriptor.name,
                    image.width(),
                    image.height(),
                    path
                );
                Template::new(descriptor.clone(), image)
            }
        };

        let template = Arc::new(template);
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.name.clone(), Arc::clone(&template));
        Ok(template)
    }

    /// Look up a loaded template by name.
    pub fn get(&self, name: &str) -> Result<Arc<Template>, StoreError> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Drop every cached scale variant; they are rebuilt on next access.
    pub fn invalidate(&self) {
        let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner);
        for template in templates.values() {
            template.invalidate();
        }
        log::info!("invalidated scale pyramids for {} templates", templates.len());
    }

    /// Build every scale variant of `set` ahead of the first frame.
    pub fn warm(&self, set: &TemplateSet, range: &ScaleRange) {
        for template in set.iter() {
            for scale in template.effective_scales(range) {
                template.scaled(scale);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.templates.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content descriptors for every supported image in `dir`.
    pub fn descriptors_in_dir<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> Result<Vec<TemplateDescriptor>, StoreError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut descriptors = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let supported = path
                .extension()
                .map(|ext| {
                    self.supported_extensions
                        .contains(&ext.to_string_lossy().to_lowercase())
                })
                .unwrap_or(false);

            if let (true, Some(stem)) = (supported, path.file_stem()) {
                let name = stem.to_string_lossy().to_string();
                descriptors.push(TemplateDescriptor::content(name).with_path(path));
            }
        }

        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptors)
    }

    fn resolve_path(
        &self,
        descriptor: &TemplateDescriptor,
        extra_dirs: &[PathBuf],
    ) -> Result<PathBuf, StoreError> {
        let dirs: Vec<&PathBuf> = self.template_dirs.iter().chain(extra_dirs).collect();

        if let Some(path) = &descriptor.path {
            let candidates =
                std::iter::once(path.clone()).chain(dirs.iter().map(|dir| dir.join(path)));
            for candidate in candidates {
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
            return Err(StoreError::MissingFile {
                name: descriptor.name.clone(),
                path: path.clone(),
            });
        }

        for candidate in self.generate_template_candidates(&descriptor.name) {
            if let Some(path) = find_template_file(&dirs, &candidate) {
                return Ok(path);
            }
        }

        Err(StoreError::Unresolved(descriptor.name.clone()))
    }

    /// Generate template file name candidates
    fn generate_template_candidates(&self, name: &str) -> Vec<String> {
        let mut candidates = Vec::new();

        for ext in &self.supported_extensions {
            candidates.push(format!("{}.{}", name, ext));
            candidates.push(format!("{}.{}", name.to_lowercase(), ext));
            candidates.push(format!("_{}.{}", name, ext));
        }

        candidates
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Find a template file in `dirs`, falling back to a case-insensitive scan
fn find_template_file(dirs: &[&PathBuf], candidate: &str) -> Option<PathBuf> {
    for dir in dirs {
        let path = dir.join(candidate);
        if path.is_file() {
            return Some(path);
        }

        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().to_lowercase() == candidate.to_lowercase() {
                    return Some(entry.path());
                }
            }
        }
    }

    None
}

fn decode_grayscale(name: &str, path: &Path) -> Result<GrayImage, StoreError> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|source| StoreError::Decode {
            name: name.to_string(),
            path: path.to_path_buf(),
            source,
        })
}
