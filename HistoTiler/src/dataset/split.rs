use crate::dataset::labels::{LabelIndex, SlideFile};
use crate::error::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// 训练/验证划分的结果，两个列表互不相交
#[derive(Debug, Clone, Default)]
pub struct SlideSplit {
    pub train: Vec<SlideFile>,
    pub validation: Vec<SlideFile>,
}

/// 按标签分组后各自打乱，每组末尾 floor(n * split) 张进入验证集
///
/// 标签缺失是致命错误，在任何切片被处理之前返回。
pub fn train_valid_split(
    slides: &[SlideFile],
    labels: &LabelIndex,
    validation_split: f32,
    seed: Option<u64>,
) -> Result<SlideSplit> {
    let mut by_label: BTreeMap<&str, Vec<SlideFile>> = BTreeMap::new();
    for slide in slides {
        let label = labels.label_of(&slide.slide_id)?;
        by_label.entry(label).or_default().push(slide.clone());
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut split = SlideSplit::default();
    for (label, mut group) in by_label {
        let n = group.len();
        // split 以 f32 保存，加一点容差避免 0.7 * 10 变成 6
        let num_val = ((n as f64) * validation_split as f64 + 1e-6).floor() as usize;
        let num_train = n - num_val.min(n);

        group.shuffle(&mut rng);
        let validation = group.split_off(num_train);
        tracing::debug!(
            "[split] {}: {} train, {} validation",
            label,
            group.len(),
            validation.len()
        );
        split.train.extend(group);
        split.validation.extend(validation);
    }

    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn slides(ids: &[&str]) -> Vec<SlideFile> {
        ids.iter()
            .map(|id| SlideFile {
                slide_id: id.to_string(),
                path: PathBuf::from(format!("{}.tiff", id)),
            })
            .collect()
    }

    fn index(content: &str) -> LabelIndex {
        let map = BTreeMap::from([("A".to_string(), 0), ("B".to_string(), 1)]);
        LabelIndex::parse(content, &map).unwrap()
    }

    #[test]
    fn test_split_partitions_slides() {
        let ids: Vec<String> = (0..10).map(|i| format!("s{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let labels: String = ids.iter().map(|id| format!("{} A\n", id)).collect();

        let split = train_valid_split(&slides(&id_refs), &index(&labels), 0.2, Some(7)).unwrap();
        assert_eq!(split.validation.len(), 2);
        assert_eq!(split.train.len(), 8);

        let train: HashSet<_> = split.train.iter().map(|s| s.slide_id.clone()).collect();
        let valid: HashSet<_> = split.validation.iter().map(|s| s.slide_id.clone()).collect();
        assert!(train.is_disjoint(&valid));
        assert_eq!(train.len() + valid.len(), 10);
    }

    #[test]
    fn test_small_group_keeps_everything_in_train() {
        // 每组 floor(2 * 0.2) = 0 张验证
        let split = train_valid_split(
            &slides(&["a1", "a2", "b1", "b2"]),
            &index("a1 A\na2 A\nb1 B\nb2 B\n"),
            0.2,
            Some(1),
        )
        .unwrap();
        assert!(split.validation.is_empty());
        assert_eq!(split.train.len(), 4);
    }

    #[test]
    fn test_seed_is_reproducible() {
        let ids = ["s1", "s2", "s3", "s4", "s5"];
        let labels = index("s1 A\ns2 A\ns3 A\ns4 A\ns5 A\n");
        let first = train_valid_split(&slides(&ids), &labels, 0.4, Some(42)).unwrap();
        let second = train_valid_split(&slides(&ids), &labels, 0.4, Some(42)).unwrap();
        assert_eq!(first.validation, second.validation);
    }

    #[test]
    fn test_missing_label_fails() {
        let result = train_valid_split(&slides(&["x"]), &index("s1 A\n"), 0.2, None);
        assert!(result.is_err());
    }
}
