use crate::layout::ScaleParameters;

/// `MainCS` from `TestCompute.wgsl`: `data[i] *= multiplier` for `i < element_count`.
pub fn main_cs(uniforms: &[u8], data: &mut [u32], global_id: [u32; 3]) {
    let Ok(params) = bytemuck::try_pod_read_unaligned::<ScaleParameters>(uniforms) else {
        return;
    };
    let index = global_id[0];
    if index >= params.element_count {
        return;
    }
    let values: &mut [f32] = bytemuck::cast_slice_mut(data);
    if let Some(value) = values.get_mut(index as usize) {
        *value *= params.multiplier;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(values: &[f32]) -> Vec<u32> {
        values.iter().map(|v| v.to_bits()).collect()
    }

    fn floats(words: &[u32]) -> Vec<f32> {
        words.iter().map(|w| f32::from_bits(*w)).collect()
    }

    #[test]
    fn scales_the_addressed_element() {
        let params = ScaleParameters::new(2.0, 3);
        let mut data = words(&[1.5, 1.5, 1.5]);
        main_cs(bytemuck::bytes_of(&params), &mut data, [1, 0, 0]);
        assert_eq!(floats(&data), vec![1.5, 3.0, 1.5]);
    }

    #[test]
    fn tail_invocations_are_ignored() {
        let params = ScaleParameters::new(2.0, 2);
        let mut data = words(&[1.0, 1.0, 1.0]);
        main_cs(bytemuck::bytes_of(&params), &mut data, [2, 0, 0]);
        main_cs(bytemuck::bytes_of(&params), &mut data, [63, 0, 0]);
        assert_eq!(floats(&data), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn short_uniform_block_is_a_no_op() {
        let mut data = words(&[1.0]);
        main_cs(&[0u8; 8], &mut data, [0, 0, 0]);
        assert_eq!(floats(&data), vec![1.0]);
    }
}
