//! 标签文件与切片扫描
//!
//! 标签文件每行为 `<slide-id><空白><label>`，label 必须出现在配置的标签表中。

use crate::error::{Result, TilerError};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// slide-id -> label
#[derive(Debug, Clone, Default)]
pub struct LabelIndex {
    by_slide: HashMap<String, String>,
    label_map: BTreeMap<String, usize>,
}

impl LabelIndex {
    pub fn from_file(path: &Path, label_map: &BTreeMap<String, usize>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TilerError::labeling(format!("cannot read label file {}: {}", path.display(), e))
        })?;
        Self::parse(&content, label_map)
    }

    pub fn parse(content: &str, label_map: &BTreeMap<String, usize>) -> Result<Self> {
        let mut by_slide = HashMap::new();

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((slide, label)) = line.split_once(char::is_whitespace) else {
                return Err(TilerError::labeling(format!(
                    "line {}: expected '<slide-id> <label>', got '{}'",
                    line_no + 1,
                    line
                )));
            };
            let label = label.trim();

            if !label_map.contains_key(label) {
                return Err(TilerError::labeling(format!(
                    "{} has unknown label {}. Label map is: {:?}",
                    slide, label, label_map
                )));
            }

            if let Some(previous) = by_slide.get(slide) {
                tracing::warn!(
                    "[LabelIndex] Duplicate entry for {} ({} / {}), keeping the first",
                    slide,
                    previous,
                    label
                );
                continue;
            }
            by_slide.insert(slide.to_string(), label.to_string());
        }

        Ok(Self {
            by_slide,
            label_map: label_map.clone(),
        })
    }

    /// 查找切片的标签，缺失时是致命错误
    pub fn label_of(&self, slide_id: &str) -> Result<&str> {
        self.by_slide
            .get(slide_id)
            .map(String::as_str)
            .ok_or_else(|| {
                TilerError::labeling(format!(
                    "Could not find label for sample: {}. Label map is: {:?}",
                    slide_id, self.label_map
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.by_slide.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slide.is_empty()
    }
}

/// 输入目录中的一张切片
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlideFile {
    pub slide_id: String,
    pub path: PathBuf,
}

/// 递归查找指定扩展名的切片文件，按路径排序
pub fn scan_slides(dir: &Path, extension: &str) -> Result<Vec<SlideFile>> {
    let wanted = extension.trim_start_matches('.').to_ascii_lowercase();
    let mut slides = Vec::new();

    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| match e.into_io_error() {
            Some(io) => TilerError::Io(io),
            None => TilerError::config(format!("cannot walk {}", dir.display())),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&wanted));
        if !matches {
            continue;
        }

        let Some(slide_id) = path.file_stem().and_then(|s| s.to_str()) else {
            tracing::warn!("[scan_slides] Skipping non UTF-8 file name {}", path.display());
            continue;
        };
        slides.push(SlideFile {
            slide_id: slide_id.to_string(),
            path: path.to_path_buf(),
        });
    }

    slides.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(slides)
}
