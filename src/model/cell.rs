use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Tensor};

/// Plain tanh recurrent cell.
#[derive(Module, Debug)]
pub struct PlainCell<B: Backend> {
    input: Linear<B>,
    recurrent: Linear<B>,
    #[module(skip)]
    hidden_size: usize,
}

impl<B: Backend> PlainCell<B> {
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        let input = LinearConfig::new(input_size, hidden_size).init(device);
        let recurrent = LinearConfig::new(hidden_size, hidden_size)
            .with_bias(false)
            .init(device);
        Self {
            input,
            recurrent,
            hidden_size,
        }
    }

    pub fn forward(&self, input: Tensor<B, 2>, hidden: &Tensor<B, 2>) -> Tensor<B, 2> {
        (self.input.forward(input) + self.recurrent.forward(hidden.clone())).tanh()
    }
}

/// Memory-augmented cell with LSTM-style gating. The persistent memory
/// vector survives across steps alongside the emitted hidden vector.
#[derive(Module, Debug)]
pub struct MemoryCell<B: Backend> {
    input: Linear<B>,
    recurrent: Linear<B>,
    #[module(skip)]
    hidden_size: usize,
}

impl<B: Backend> MemoryCell<B> {
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        let input = LinearConfig::new(input_size, 4 * hidden_size).init(device);
        let recurrent = LinearConfig::new(hidden_size, 4 * hidden_size)
            .with_bias(false)
            .init(device);
        Self {
            input,
            recurrent,
            hidden_size,
        }
    }

    pub fn forward(
        &self,
        input: Tensor<B, 2>,
        hidden: &Tensor<B, 2>,
        memory: &Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let gates = self.input.forward(input) + self.recurrent.forward(hidden.clone());
        let parts = gates.chunk(4, 1);
        let in_gate = activation::sigmoid(parts[0].clone());
        let forget_gate = activation::sigmoid(parts[1].clone());
        let candidate = parts[2].clone().tanh();
        let out_gate = activation::sigmoid(parts[3].clone());

        let memory = forget_gate * memory.clone() + in_gate * candidate;
        let hidden = out_gate * memory.clone().tanh();
        (hidden, memory)
    }
}

/// One recurrent layer's state between steps.
#[derive(Clone, Debug)]
pub enum LayerState<B: Backend> {
    Plain(Tensor<B, 2>),
    Memory {
        hidden: Tensor<B, 2>,
        memory: Tensor<B, 2>,
    },
}

impl<B: Backend> LayerState<B> {
    /// The vector fed upward to the next layer (and out of the stack).
    pub fn output(&self) -> Tensor<B, 2> {
        match self {
            LayerState::Plain(hidden) => hidden.clone(),
            LayerState::Memory { hidden, .. } => hidden.clone(),
        }
    }

    /// The vector attention should query with. Memory cells expose their
    /// persistent memory component here, not the emitted output.
    pub fn query(&self) -> Tensor<B, 2> {
        match self {
            LayerState::Plain(hidden) => hidden.clone(),
            LayerState::Memory { memory, .. } => memory.clone(),
        }
    }
}

#[derive(Module, Debug)]
pub enum RecurrentCell<B: Backend> {
    Plain(PlainCell<B>),
    Memory(MemoryCell<B>),
}

impl<B: Backend> RecurrentCell<B> {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        use_memory: bool,
        device: &B::Device,
    ) -> Self {
        if use_memory {
            RecurrentCell::Memory(MemoryCell::new(input_size, hidden_size, device))
        } else {
            RecurrentCell::Plain(PlainCell::new(input_size, hidden_size, device))
        }
    }

    pub fn init_state(&self, batch: usize, device: &B::Device) -> LayerState<B> {
        match self {
            RecurrentCell::Plain(cell) => {
                LayerState::Plain(Tensor::zeros([batch, cell.hidden_size], device))
            }
            RecurrentCell::Memory(cell) => LayerState::Memory {
                hidden: Tensor::zeros([batch, cell.hidden_size], device),
                memory: Tensor::zeros([batch, cell.hidden_size], device),
            },
        }
    }

    pub fn forward(&self, input: Tensor<B, 2>, state: &LayerState<B>) -> LayerState<B> {
        match (self, state) {
            (RecurrentCell::Plain(cell), LayerState::Plain(hidden)) => {
                LayerState::Plain(cell.forward(input, hidden))
            }
            (RecurrentCell::Memory(cell), LayerState::Memory { hidden, memory }) => {
                let (hidden, memory) = cell.forward(input, hidden, memory);
                LayerState::Memory { hidden, memory }
            }
            _ => unreachable!("layer state variant does not match its cell"),
        }
    }
}

/// Whole-stack state; layer 0 is the bottom.
#[derive(Clone, Debug)]
pub struct StackState<B: Backend> {
    pub layers: Vec<LayerState<B>>,
}

impl<B: Backend> StackState<B> {
    pub fn output(&self) -> Tensor<B, 2> {
        self.layers
            .last()
            .expect("recurrent stack has at least one layer")
            .output()
    }

    /// Only the deepest layer drives attention, whatever the stack depth.
    pub fn query(&self) -> Tensor<B, 2> {
        self.layers
            .last()
            .expect("recurrent stack has at least one layer")
            .query()
    }
}

/// Stacked recurrent cells with inter-layer dropout.
#[derive(Module, Debug)]
pub struct RecurrentStack<B: Backend> {
    layers: Vec<RecurrentCell<B>>,
    dropout: Dropout,
}

impl<B: Backend> RecurrentStack<B> {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        use_memory: bool,
        dropout: f64,
        apply_dropout: bool,
        device: &B::Device,
    ) -> Self {
        assert!(num_layers > 0, "num_layers must be > 0");
        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let in_size = if layer == 0 { input_size } else { hidden_size };
            layers.push(RecurrentCell::new(in_size, hidden_size, use_memory, device));
        }
        let prob = if apply_dropout { dropout } else { 0.0 };
        Self {
            layers,
            dropout: DropoutConfig::new(prob).init(),
        }
    }

    pub fn init_state(&self, batch: usize, device: &B::Device) -> StackState<B> {
        StackState {
            layers: self
                .layers
                .iter()
                .map(|cell| cell.init_state(batch, device))
                .collect(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 2>, state: &StackState<B>) -> StackState<B> {
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut upward = input;
        for (cell, layer_state) in self.layers.iter().zip(&state.layers) {
            let next = cell.forward(upward, layer_state);
            upward = self.dropout.forward(next.output());
            layers.push(next);
        }
        StackState { layers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn tensor(values: &[f32], shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::<TestBackend, 1>::from_floats(values, &Default::default()).reshape(shape)
    }

    #[test]
    fn test_memory_state_query_is_memory_component() {
        let hidden = tensor(&[1.0, 2.0], [1, 2]);
        let memory = tensor(&[3.0, 4.0], [1, 2]);
        let state = LayerState::Memory {
            hidden: hidden.clone(),
            memory: memory.clone(),
        };

        let query = state.query().into_data().to_vec::<f32>().unwrap();
        assert_eq!(query, vec![3.0, 4.0]);
        let output = state.output().into_data().to_vec::<f32>().unwrap();
        assert_eq!(output, vec![1.0, 2.0]);
    }

    #[test]
    fn test_stack_query_comes_from_deepest_layer() {
        let state = StackState::<TestBackend> {
            layers: vec![
                LayerState::Plain(tensor(&[1.0, 1.0], [1, 2])),
                LayerState::Plain(tensor(&[7.0, 8.0], [1, 2])),
            ],
        };
        let query = state.query().into_data().to_vec::<f32>().unwrap();
        assert_eq!(query, vec![7.0, 8.0]);
    }

    #[test]
    fn test_stack_forward_threads_state() {
        let device = Default::default();
        let stack = RecurrentStack::<TestBackend>::new(3, 4, 2, true, 0.1, false, &device);
        let state = stack.init_state(2, &device);
        assert_eq!(state.layers.len(), 2);

        let input = tensor(&[0.5, -0.5, 0.2, 0.1, 0.0, -0.1], [2, 3]);
        let next = stack.forward(input, &state);
        assert_eq!(next.output().dims(), [2, 4]);
        assert_eq!(next.query().dims(), [2, 4]);
    }

    #[test]
    fn test_plain_cell_forward_is_bounded() {
        let device = Default::default();
        let cell = PlainCell::<TestBackend>::new(2, 3, &device);
        let hidden = Tensor::zeros([1, 3], &device);
        let out = cell.forward(tensor(&[10.0, -10.0], [1, 2]), &hidden);
        for value in out.into_data().to_vec::<f32>().unwrap() {
            assert!(value.abs() <= 1.0);
        }
    }
}
