//! Classification and metric-learning losses.
//!
//! Proxy-based metric losses (`cosface`, `arcface`, `subcenter_arcface`)
//! own a learnable [`ProxyHead`] that is optimized alongside the backbone in
//! its own parameter group. They accept mined pairs for a uniform call
//! surface but always score the whole batch against the proxies.

use std::fmt;
use std::str::FromStr;

use burn::{
    module::{Module, Param},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    tensor::{activation::relu, backend::Backend, Distribution, Int, Tensor, TensorData},
};
use vision_core::{Error, Result, TaskKind};

use crate::miner::MinedPairs;
use crate::model::l2_normalize;

/// Loss selected by `Models.loss`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    CrossEntropy,
    LabelSmooth,
    CosFace,
    ArcFace,
    SubCenterArcFace,
    Circle,
}

impl LossKind {
    /// Task the loss is defined for
    pub fn task(&self) -> TaskKind {
        match self {
            LossKind::CrossEntropy | LossKind::LabelSmooth => TaskKind::Classification,
            _ => TaskKind::Metric,
        }
    }

    /// Resolves `name` and checks it against the task of the model
    pub fn for_task(name: &str, task: TaskKind) -> Result<Self> {
        let kind: LossKind = name.parse()?;
        if kind.task() != task {
            return Err(Error::Config(format!(
                "loss '{kind}' is a {} loss but the backbone is a {task} model",
                kind.task()
            )));
        }
        Ok(kind)
    }

    pub fn has_proxies(&self) -> bool {
        matches!(
            self,
            LossKind::CosFace | LossKind::ArcFace | LossKind::SubCenterArcFace
        )
    }
}

impl FromStr for LossKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cross_entropy" => Ok(LossKind::CrossEntropy),
            "label_smooth" => Ok(LossKind::LabelSmooth),
            "cosface" => Ok(LossKind::CosFace),
            "arcface" => Ok(LossKind::ArcFace),
            "subcenter_arcface" => Ok(LossKind::SubCenterArcFace),
            "circleloss" => Ok(LossKind::Circle),
            other => Err(Error::Config(format!("unknown loss '{other}'"))),
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LossKind::CrossEntropy => "cross_entropy",
            LossKind::LabelSmooth => "label_smooth",
            LossKind::CosFace => "cosface",
            LossKind::ArcFace => "arcface",
            LossKind::SubCenterArcFace => "subcenter_arcface",
            LossKind::Circle => "circleloss",
        };
        f.write_str(name)
    }
}

/// Cross entropy over class logits
pub struct ClassificationLoss<B: Backend> {
    inner: CrossEntropyLoss<B>,
}

impl<B: Backend> ClassificationLoss<B> {
    pub fn new(kind: LossKind, device: &B::Device) -> Result<Self> {
        let config = match kind {
            LossKind::CrossEntropy => CrossEntropyLossConfig::new(),
            LossKind::LabelSmooth => CrossEntropyLossConfig::new().with_smoothing(Some(0.1)),
            other => {
                return Err(Error::Config(format!(
                    "'{other}' is not a classification loss"
                )))
            }
        };
        Ok(Self {
            inner: config.init(device),
        })
    }

    pub fn forward(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.inner.forward(logits, targets)
    }
}

/// Learnable class proxies in embedding space
#[derive(Module, Debug)]
pub struct ProxyHead<B: Backend> {
    /// `[embedding_size, num_classes * sub_centers]`
    weight: Param<Tensor<B, 2>>,
    num_classes: usize,
    sub_centers: usize,
}

impl<B: Backend> ProxyHead<B> {
    pub fn new(
        embedding_size: usize,
        num_classes: usize,
        sub_centers: usize,
        device: &B::Device,
    ) -> Self {
        let sub_centers = sub_centers.max(1);
        let weight = Tensor::random(
            [embedding_size, num_classes * sub_centers],
            Distribution::Normal(0.0, 1.0),
            device,
        );
        Self {
            weight: Param::from_tensor(weight),
            num_classes,
            sub_centers,
        }
    }

    /// `[N, C]` cosine between every embedding and its closest sub-center
    /// of every class
    pub fn cosine(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        let weight = self.weight.val();
        let norm = weight.clone().powf_scalar(2.0).sum_dim(0).sqrt().clamp_min(1e-12);
        let cos = l2_normalize(embeddings).matmul(weight / norm);

        if self.sub_centers == 1 {
            return cos;
        }
        let [n, _] = cos.dims();
        cos.reshape([n, self.num_classes, self.sub_centers])
            .max_dim(2)
            .reshape([n, self.num_classes])
    }
}

const PROXY_SCALE: f64 = 64.0;
const COSFACE_MARGIN: f64 = 0.35;
const ARCFACE_MARGIN: f64 = 0.5;
const SUB_CENTERS: usize = 3;
const CIRCLE_MARGIN: f64 = 0.4;
const CIRCLE_GAMMA: f64 = 80.0;

/// Loss over `(embeddings, labels, mined pairs)`
pub struct MetricLoss<B: Backend> {
    kind: LossKind,
    head: Option<ProxyHead<B>>,
    cross_entropy: CrossEntropyLoss<B>,
}

impl<B: Backend> MetricLoss<B> {
    pub fn new(
        kind: LossKind,
        num_classes: usize,
        embedding_size: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let head = match kind {
            LossKind::CosFace | LossKind::ArcFace => {
                Some(ProxyHead::new(embedding_size, num_classes, 1, device))
            }
            LossKind::SubCenterArcFace => {
                Some(ProxyHead::new(embedding_size, num_classes, SUB_CENTERS, device))
            }
            LossKind::Circle => None,
            other => {
                return Err(Error::Config(format!("'{other}' is not a metric loss")));
            }
        };
        Ok(Self {
            kind,
            head,
            cross_entropy: CrossEntropyLossConfig::new().init(device),
        })
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    pub fn head(&self) -> Option<&ProxyHead<B>> {
        self.head.as_ref()
    }

    /// Replaces the proxy head with `f(head)`, e.g. after an optimizer step
    pub fn update_head<F>(&mut self, f: F)
    where
        F: FnOnce(ProxyHead<B>) -> ProxyHead<B>,
    {
        if let Some(head) = self.head.take() {
            self.head = Some(f(head));
        }
    }

    pub fn forward(
        &self,
        embeddings: Tensor<B, 2>,
        labels: &[usize],
        targets: Tensor<B, 1, Int>,
        pairs: &MinedPairs,
    ) -> Tensor<B, 1> {
        match (&self.head, self.kind) {
            (Some(head), LossKind::CosFace) => {
                let cos = head.cosine(embeddings);
                let onehot = one_hot::<B>(labels, cos.dims()[1], &cos.device());
                let logits = (cos - onehot.mul_scalar(COSFACE_MARGIN)).mul_scalar(PROXY_SCALE);
                self.cross_entropy.forward(logits, targets)
            }
            (Some(head), _) => {
                let cos = head.cosine(embeddings).clamp(-1.0 + 1e-7, 1.0 - 1e-7);
                let onehot = one_hot::<B>(labels, cos.dims()[1], &cos.device());
                let sin = cos.clone().powf_scalar(2.0).neg().add_scalar(1.0).clamp_min(1e-7).sqrt();
                let phi = cos.clone().mul_scalar(ARCFACE_MARGIN.cos())
                    - sin.mul_scalar(ARCFACE_MARGIN.sin());
                let logits = (onehot.clone() * phi + (onehot.neg().add_scalar(1.0)) * cos)
                    .mul_scalar(PROXY_SCALE);
                self.cross_entropy.forward(logits, targets)
            }
            (None, _) => circle_loss(embeddings, pairs),
        }
    }
}

fn one_hot<B: Backend>(labels: &[usize], num_classes: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        if label < num_classes {
            values[row * num_classes + label] = 1.0;
        }
    }
    Tensor::from_floats(TensorData::new(values, [labels.len(), num_classes]), device)
}

/// Circle loss over the mined pairs of each anchor, averaged over anchors
/// that have both a positive and a negative.
fn circle_loss<B: Backend>(embeddings: Tensor<B, 2>, pairs: &MinedPairs) -> Tensor<B, 1> {
    let [n, _] = embeddings.dims();
    let device = embeddings.device();
    let normalized = l2_normalize(embeddings);
    let sim = normalized.clone().matmul(normalized.transpose());

    let (positive, negative, anchors) = pairs.masks(n);
    let valid = anchors.iter().filter(|&&v| v > 0.0).count();
    if valid == 0 {
        // zero loss that still reaches the graph
        return sim.sum().mul_scalar(0.0);
    }

    let positive = Tensor::<B, 2>::from_floats(TensorData::new(positive, [n, n]), &device);
    let negative = Tensor::<B, 2>::from_floats(TensorData::new(negative, [n, n]), &device);
    let anchors = Tensor::<B, 2>::from_floats(TensorData::new(anchors, [n, 1]), &device);

    let m = CIRCLE_MARGIN;
    let ap = sim.clone().neg().add_scalar(1.0 + m).clamp_min(0.0).detach();
    let an = sim.clone().add_scalar(m).clamp_min(0.0).detach();
    let logit_p = (ap * sim.clone().sub_scalar(1.0 - m)).mul_scalar(-CIRCLE_GAMMA);
    let logit_n = (an * sim.sub_scalar(m)).mul_scalar(CIRCLE_GAMMA);

    let per_anchor = softplus(masked_logsumexp(logit_p, positive) + masked_logsumexp(logit_n, negative));
    (per_anchor * anchors).sum().div_scalar(valid as f64)
}

/// Row-wise logsumexp over the entries selected by `mask`
fn masked_logsumexp<B: Backend>(logits: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
    let fill = mask.clone().neg().add_scalar(1.0).mul_scalar(-1e4);
    let masked = logits * mask + fill;
    let max = masked.clone().max_dim(1).detach();
    (masked - max.clone()).exp().sum_dim(1).log() + max
}

fn softplus<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    relu(x.clone()) + x.abs().neg().exp().add_scalar(1.0).log()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    fn targets(labels: &[usize]) -> Tensor<TestBackend, 1, Int> {
        let data: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        Tensor::from_data(TensorData::new(data, [labels.len()]), &NdArrayDevice::Cpu)
    }

    #[test]
    fn test_loss_names_and_tasks() {
        assert_eq!("arcface".parse::<LossKind>().unwrap(), LossKind::ArcFace);
        assert_eq!(LossKind::Circle.to_string(), "circleloss");
        assert!(matches!("triplet".parse::<LossKind>(), Err(Error::Config(_))));

        assert!(LossKind::for_task("cross_entropy", TaskKind::Classification).is_ok());
        assert!(matches!(
            LossKind::for_task("cosface", TaskKind::Classification),
            Err(Error::Config(_))
        ));
        assert!(LossKind::for_task("label_smooth", TaskKind::Metric).is_err());
    }

    #[test]
    fn test_metric_loss_rejects_classification_kind() {
        let device = NdArrayDevice::Cpu;
        assert!(MetricLoss::<TestBackend>::new(LossKind::CrossEntropy, 3, 4, &device).is_err());
        assert!(ClassificationLoss::<TestBackend>::new(LossKind::Circle, &device).is_err());
    }

    #[test]
    fn test_classification_loss_prefers_correct_logits() {
        let device = NdArrayDevice::Cpu;
        let loss = ClassificationLoss::<TestBackend>::new(LossKind::CrossEntropy, &device).unwrap();
        let good = Tensor::from_floats([[5.0, 0.0], [0.0, 5.0]], &device);
        let bad = Tensor::from_floats([[0.0, 5.0], [5.0, 0.0]], &device);
        assert!(scalar(loss.forward(good, targets(&[0, 1]))) < scalar(loss.forward(bad, targets(&[0, 1]))));
    }

    #[test]
    fn test_subcenter_cosine_shape() {
        let device = NdArrayDevice::Cpu;
        let head = ProxyHead::<TestBackend>::new(4, 3, SUB_CENTERS, &device);
        let cos = head.cosine(Tensor::random([5, 4], Distribution::Normal(0.0, 1.0), &device));
        assert_eq!(cos.dims(), [5, 3]);
        let values: Vec<f32> = cos.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| v.abs() <= 1.0 + 1e-5));
    }

    #[test]
    fn test_proxy_losses_are_finite() {
        let device = NdArrayDevice::Cpu;
        let embeddings = Tensor::<TestBackend, 2>::random([4, 6], Distribution::Normal(0.0, 1.0), &device);
        let labels = [0, 1, 2, 1];
        for kind in [LossKind::CosFace, LossKind::ArcFace, LossKind::SubCenterArcFace] {
            let loss = MetricLoss::<TestBackend>::new(kind, 3, 6, &device).unwrap();
            assert!(loss.head().is_some());
            let value = scalar(loss.forward(embeddings.clone(), &labels, targets(&labels), &MinedPairs::default()));
            assert!(value.is_finite() && value > 0.0, "{kind}: {value}");
        }
    }

    #[test]
    fn test_circle_loss_without_pairs_is_zero() {
        let device = NdArrayDevice::Cpu;
        let loss = MetricLoss::<TestBackend>::new(LossKind::Circle, 2, 2, &device).unwrap();
        assert!(loss.head().is_none());
        let embeddings = Tensor::from_floats([[1.0, 0.0], [0.0, 1.0]], &device);
        let value = scalar(loss.forward(embeddings, &[0, 1], targets(&[0, 1]), &MinedPairs::default()));
        assert_eq!(value, 0.0);
    }

    #[test]
    fn test_circle_loss_penalizes_confused_pairs() {
        let device = NdArrayDevice::Cpu;
        let loss = MetricLoss::<TestBackend>::new(LossKind::Circle, 2, 2, &device).unwrap();
        let labels = [0, 0, 1];
        let pairs = MinedPairs {
            positives: vec![(0, 1)],
            negatives: vec![(0, 2)],
        };

        let separated = Tensor::from_floats([[1.0, 0.0], [1.0, 0.05], [-1.0, 0.0]], &device);
        let confused = Tensor::from_floats([[1.0, 0.0], [-1.0, 0.0], [1.0, 0.05]], &device);

        let easy = scalar(loss.forward(separated, &labels, targets(&labels), &pairs));
        let hard = scalar(loss.forward(confused, &labels, targets(&labels), &pairs));
        assert!(easy.is_finite() && hard.is_finite());
        assert!(easy < hard, "easy {easy} vs hard {hard}");
    }
}
