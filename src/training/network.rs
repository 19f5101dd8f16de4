//! Policy/value network built with the Burn framework
//!
//! Three input branches (history, draw pile, hands) are fused and feed a
//! masked policy head and a tanh value head:
//!
//! ```text
//! history  [58, 16] ─ dense 32 ─ dense 16 ─ biGRU 32 ─┐
//! drawpile [13, 11] ─ dense 16 ─ dense 16 ─ biGRU 16 ─┼─ concat ─ dense 128 ─ dropout ─ dense 128 ─┬─ policy
//! hands    [69]     ─ dense 32 ─ dense 32 ────────────┘                                           └─ value
//! ```

use burn::module::Module;
use burn::nn::gru::{Gru, GruConfig};
use burn::nn::{Dropout, DropoutConfig, LeakyRelu, LeakyReluConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{softmax, tanh};

use super::samples::{
    HANDS_WIDTH, INPUT_NAMES, InputBatch, InputShapes, MAX_CARDS_IN_DRAW_PILE, MAX_HISTORY,
    N_ACTION_FEATURES, N_OUTPUTS, NUM_CARD_TYPES, OUTPUT_NAMES,
};
use crate::error::TrainError;

/// Layer widths and regularization of the policy/value network
#[derive(Debug, Config)]
pub struct NetConfig {
    #[config(default = "N_ACTION_FEATURES")]
    pub action_features: usize,
    #[config(default = "NUM_CARD_TYPES")]
    pub card_types: usize,
    #[config(default = "HANDS_WIDTH")]
    pub hands_width: usize,
    #[config(default = "N_OUTPUTS")]
    pub policy_width: usize,

    #[config(default = 32)]
    pub history_hidden_1: usize,
    #[config(default = 16)]
    pub history_hidden_2: usize,
    #[config(default = 32)]
    pub history_recurrent: usize,

    #[config(default = 16)]
    pub drawpile_hidden_1: usize,
    #[config(default = 16)]
    pub drawpile_hidden_2: usize,
    #[config(default = 16)]
    pub drawpile_recurrent: usize,

    #[config(default = 32)]
    pub hands_hidden_1: usize,
    #[config(default = 32)]
    pub hands_hidden_2: usize,

    #[config(default = 128)]
    pub fusion_hidden: usize,
    #[config(default = 0.2)]
    pub dropout: f64,
    /// Negative slope of every leaky ReLU
    #[config(default = 0.3)]
    pub leaky_slope: f64,
    /// L2 penalty on the policy and value head kernels
    #[config(default = 0.001)]
    pub head_l2: f64,
}

impl NetConfig {
    /// Validate loaded per-sample shapes against the fixed dimensions and
    /// return the matching default configuration.
    pub fn from_shapes(shapes: &InputShapes) -> Result<Self, TrainError> {
        let expected = InputShapes::default();
        let checks = [
            (INPUT_NAMES[0], &shapes.history, &expected.history),
            (INPUT_NAMES[1], &shapes.hands, &expected.hands),
            (INPUT_NAMES[2], &shapes.drawpile, &expected.drawpile),
            (INPUT_NAMES[3], &shapes.output_mask, &expected.output_mask),
        ];
        for (name, actual, expected) in checks {
            if actual != expected {
                return Err(TrainError::InputShape {
                    name: name.to_string(),
                    actual: actual.clone(),
                    expected: expected.clone(),
                });
            }
        }
        if shapes.policy_width != shapes.output_mask[0] {
            return Err(TrainError::InputShape {
                name: OUTPUT_NAMES[0].to_string(),
                actual: vec![shapes.policy_width],
                expected: vec![shapes.output_mask[0]],
            });
        }

        Ok(Self::new())
    }

    /// Initialize a network with fresh parameters
    pub fn init<B: Backend>(&self, device: &B::Device) -> PolicyValueNet<B> {
        let activation = LeakyReluConfig::new()
            .with_negative_slope(self.leaky_slope)
            .init();

        let history = SequenceBranch::new(
            device,
            self.action_features,
            self.history_hidden_1,
            self.history_hidden_2,
            self.history_recurrent,
            activation.clone(),
        );
        let drawpile = SequenceBranch::new(
            device,
            self.card_types,
            self.drawpile_hidden_1,
            self.drawpile_hidden_2,
            self.drawpile_recurrent,
            activation.clone(),
        );
        let hands = HandsBranch {
            dense_1: LinearConfig::new(self.hands_width, self.hands_hidden_1).init(device),
            dense_2: LinearConfig::new(self.hands_hidden_1, self.hands_hidden_2).init(device),
            activation: activation.clone(),
        };

        let fused_width = history.output_size() + drawpile.output_size() + self.hands_hidden_2;
        let fusion_1 = LinearConfig::new(fused_width, self.fusion_hidden).init(device);
        let fusion_2 = LinearConfig::new(self.fusion_hidden, self.fusion_hidden).init(device);

        PolicyValueNet {
            history,
            drawpile,
            hands,
            fusion_1,
            dropout: DropoutConfig::new(self.dropout).init(),
            fusion_2,
            policy: LinearConfig::new(self.fusion_hidden, self.policy_width).init(device),
            value: LinearConfig::new(self.fusion_hidden, 1).init(device),
            activation,
            head_l2: self.head_l2,
        }
    }

    /// Human readable layer listing
    pub fn summary(&self) -> String {
        let history_out = 2 * self.history_recurrent;
        let drawpile_out = 2 * self.drawpile_recurrent;
        let fused = history_out + drawpile_out + self.hands_hidden_2;

        let lines = [
            format!(
                "history     [{MAX_HISTORY}, {}] -> dense {} -> dense {} -> bigru {} -> [{history_out}]",
                self.action_features,
                self.history_hidden_1,
                self.history_hidden_2,
                self.history_recurrent
            ),
            format!(
                "drawpile    [{MAX_CARDS_IN_DRAW_PILE}, {}] -> dense {} -> dense {} -> bigru {} -> [{drawpile_out}]",
                self.card_types,
                self.drawpile_hidden_1,
                self.drawpile_hidden_2,
                self.drawpile_recurrent
            ),
            format!(
                "hands       [{}] -> dense {} -> dense {}",
                self.hands_width, self.hands_hidden_1, self.hands_hidden_2
            ),
            format!(
                "fusion      [{fused}] -> dense {} -> dropout {} -> dense {}",
                self.fusion_hidden, self.dropout, self.fusion_hidden
            ),
            format!(
                "policy      dense {} (l2 {}) * output_mask [{}] -> masked softmax",
                self.policy_width, self.head_l2, self.policy_width
            ),
            format!("value       dense 1 (l2 {}) -> tanh", self.head_l2),
            format!("leaky relu slope {}", self.leaky_slope),
        ];
        lines.join("\n")
    }
}

/// Build the network for the given input shapes.
///
/// Fails when a shape disagrees with the fixed dimensions.
pub fn build_model<B: Backend>(
    shapes: &InputShapes,
    device: &B::Device,
) -> Result<(NetConfig, PolicyValueNet<B>), TrainError> {
    tracing::info!("Building model");
    tracing::info!("History input shape: {:?}", shapes.history);
    tracing::info!("Hands input shape: {:?}", shapes.hands);
    tracing::info!("Draw pile input shape: {:?}", shapes.drawpile);
    tracing::info!("Output mask shape: {:?}", shapes.output_mask);
    tracing::info!("Policy output shape: {}", shapes.policy_width);

    let config = NetConfig::from_shapes(shapes)?;
    let model = config.init(device);
    Ok((config, model))
}

/// Bidirectional GRU reducing a sequence to the concatenation of the
/// final forward state and the final backward state
#[derive(Module, Debug)]
pub struct BidirectionalGru<B: Backend> {
    forward_cell: Gru<B>,
    backward_cell: Gru<B>,
    hidden_size: usize,
}

impl<B: Backend> BidirectionalGru<B> {
    pub fn new(device: &B::Device, input_size: usize, hidden_size: usize) -> Self {
        Self {
            forward_cell: GruConfig::new(input_size, hidden_size, true).init(device),
            backward_cell: GruConfig::new(input_size, hidden_size, true).init(device),
            hidden_size,
        }
    }

    pub fn output_size(&self) -> usize {
        2 * self.hidden_size
    }

    /// sequence: [batch, time, features] -> [batch, 2 * hidden]
    pub fn forward(&self, sequence: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, seq_len, _] = sequence.dims();
        let hidden = self.hidden_size;

        let forward_states = self.forward_cell.forward(sequence.clone(), None);
        let forward_last: Tensor<B, 2> = forward_states
            .slice([0..batch_size, seq_len - 1..seq_len, 0..hidden])
            .squeeze(1);

        let backward_states = self.backward_cell.forward(sequence.flip([1]), None);
        let backward_last: Tensor<B, 2> = backward_states
            .slice([0..batch_size, seq_len - 1..seq_len, 0..hidden])
            .squeeze(1);

        Tensor::cat(vec![forward_last, backward_last], 1)
    }
}

/// Two time-distributed dense layers followed by a bidirectional GRU
#[derive(Module, Debug)]
pub struct SequenceBranch<B: Backend> {
    dense_1: Linear<B>,
    dense_2: Linear<B>,
    recurrent: BidirectionalGru<B>,
    activation: LeakyRelu,
}

impl<B: Backend> SequenceBranch<B> {
    pub fn new(
        device: &B::Device,
        input_size: usize,
        hidden_1: usize,
        hidden_2: usize,
        recurrent: usize,
        activation: LeakyRelu,
    ) -> Self {
        Self {
            dense_1: LinearConfig::new(input_size, hidden_1).init(device),
            dense_2: LinearConfig::new(hidden_1, hidden_2).init(device),
            recurrent: BidirectionalGru::new(device, hidden_2, recurrent),
            activation,
        }
    }

    pub fn output_size(&self) -> usize {
        self.recurrent.output_size()
    }

    pub fn forward(&self, sequence: Tensor<B, 3>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.dense_1.forward(sequence));
        let x = self.activation.forward(self.dense_2.forward(x));
        self.recurrent.forward(x)
    }
}

/// Two dense layers over the flat hands encoding
#[derive(Module, Debug)]
pub struct HandsBranch<B: Backend> {
    dense_1: Linear<B>,
    dense_2: Linear<B>,
    activation: LeakyRelu,
}

impl<B: Backend> HandsBranch<B> {
    pub fn forward(&self, hands: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.dense_1.forward(hands));
        self.activation.forward(self.dense_2.forward(x))
    }
}

/// Network outputs for a batch
#[derive(Debug, Clone)]
pub struct NetOutput<B: Backend> {
    /// [batch_size, policy_width], zero on masked actions, rows sum to 1
    pub policy: Tensor<B, 2>,
    /// [batch_size, 1], in [-1, 1]
    pub value: Tensor<B, 2>,
}

/// Joint policy/value network
#[derive(Module, Debug)]
pub struct PolicyValueNet<B: Backend> {
    history: SequenceBranch<B>,
    drawpile: SequenceBranch<B>,
    hands: HandsBranch<B>,
    fusion_1: Linear<B>,
    dropout: Dropout,
    fusion_2: Linear<B>,
    /// Policy head (logits for each action)
    policy: Linear<B>,
    /// Value head
    value: Linear<B>,
    activation: LeakyRelu,
    head_l2: f64,
}

impl<B: Backend> PolicyValueNet<B> {
    pub fn forward(&self, inputs: InputBatch<B>) -> NetOutput<B> {
        let features = self.trunk(inputs.history, inputs.hands, inputs.drawpile);

        let logits = self.policy.forward(features.clone());
        let policy = masked_softmax(logits, inputs.output_mask);
        let value = tanh(self.value.forward(features));

        NetOutput { policy, value }
    }

    /// Shared representation ahead of the two heads
    fn trunk(
        &self,
        history: Tensor<B, 3>,
        hands: Tensor<B, 2>,
        drawpile: Tensor<B, 3>,
    ) -> Tensor<B, 2> {
        let merged = Tensor::cat(
            vec![
                self.history.forward(history),
                self.drawpile.forward(drawpile),
                self.hands.forward(hands),
            ],
            1,
        );

        let x = self.activation.forward(self.fusion_1.forward(merged));
        let x = self.dropout.forward(x);
        self.activation.forward(self.fusion_2.forward(x))
    }

    /// L2 penalty on the head kernels, added to the training loss
    pub fn regularization_loss(&self) -> Tensor<B, 1> {
        let policy = self.policy.weight.val().powf_scalar(2.0).sum();
        let value = self.value.weight.val().powf_scalar(2.0).sum();
        (policy + value).mul_scalar(self.head_l2)
    }
}

/// Multiply logits by the mask, then normalize over the unmasked positions.
///
/// mask: [batch_size, actions] where 0.0 marks an illegal action. Illegal
/// actions get exactly zero probability. A row without any legal action
/// falls back to a plain softmax over its masked logits.
pub fn masked_softmax<B: Backend>(logits: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
    let legal = mask.clone().equal_elem(0.0).bool_not().float();
    let any_legal = legal.clone().sum_dim(1).clamp_max(1.0);
    let illegal = (legal.ones_like() - legal) * any_legal;

    let masked_logits = (logits * mask).mask_fill(illegal.equal_elem(1.0), f32::NEG_INFINITY);
    softmax(masked_logits, 1)
}
