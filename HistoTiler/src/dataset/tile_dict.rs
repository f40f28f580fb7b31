use std::collections::BTreeMap;
use std::path::PathBuf;

/// 标签 -> 切片 -> tile 路径（保持写入顺序）
///
/// 所有配置的标签总是存在，即使没有任何切片。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileDict {
    classes: BTreeMap<String, BTreeMap<String, Vec<PathBuf>>>,
}

impl TileDict {
    pub fn with_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classes: labels.into_iter().map(|l| (l.into(), BTreeMap::new())).collect(),
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &String> {
        self.classes.keys()
    }

    pub fn slides(&self, label: &str) -> Option<&BTreeMap<String, Vec<PathBuf>>> {
        self.classes.get(label)
    }

    /// 取得某张切片的列表，不存在则创建；标签未知时返回 None
    pub fn slide_entry(&mut self, label: &str, slide_id: &str) -> Option<&mut Vec<PathBuf>> {
        self.classes
            .get_mut(label)
            .map(|slides| slides.entry(slide_id.to_string()).or_default())
    }

    pub fn tiles(&self, label: &str, slide_id: &str) -> Option<&[PathBuf]> {
        self.classes
            .get(label)
            .and_then(|slides| slides.get(slide_id))
            .map(|tiles| tiles.as_slice())
    }

    /// 每个标签下的 tile 总数
    pub fn class_counts(&self) -> BTreeMap<String, usize> {
        self.classes
            .iter()
            .map(|(label, slides)| (label.clone(), slides.values().map(Vec::len).sum()))
            .collect()
    }

    pub fn total_tiles(&self) -> usize {
        self.class_counts().values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Vec<PathBuf>>)> {
        self.classes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut BTreeMap<String, Vec<PathBuf>>)> {
        self.classes.iter_mut()
    }

    /// 按 (label, slide, path) 展开，便于写出索引文件
    pub fn flatten(&self) -> impl Iterator<Item = (&str, &str, &PathBuf)> {
        self.classes.iter().flat_map(|(label, slides)| {
            slides.iter().flat_map(move |(slide, tiles)| {
                tiles.iter().map(move |path| (label.as_str(), slide.as_str(), path))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_always_present() {
        let dict = TileDict::with_labels(["A", "B"]);
        assert_eq!(dict.labels().cloned().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(dict.class_counts().get("B"), Some(&0));
        assert_eq!(dict.total_tiles(), 0);
    }

    #[test]
    fn test_entries_and_counts() {
        let mut dict = TileDict::with_labels(["A", "B"]);
        dict.slide_entry("A", "s1").unwrap().push(PathBuf::from("t1"));
        dict.slide_entry("A", "s1").unwrap().push(PathBuf::from("t2"));
        dict.slide_entry("A", "s2").unwrap();
        assert!(dict.slide_entry("C", "s3").is_none());

        assert_eq!(dict.class_counts().get("A"), Some(&2));
        assert_eq!(dict.tiles("A", "s2"), Some(&[][..]));
        assert_eq!(dict.flatten().count(), 2);
    }
}
