use av_reader_writer::{PixelBuffer, PixelFormat};

use super::FilterPreset;

fn frame(bgra: [u8; 4]) -> PixelBuffer {
    let mut buffer = PixelBuffer::new(2, 2, PixelFormat::Bgra32);
    for y in 0..2 {
        for px in buffer.row_mut(y).chunks_exact_mut(4) {
            px.copy_from_slice(&bgra);
        }
    }
    buffer
}

fn first_pixel(buffer: &PixelBuffer) -> [u8; 4] {
    let row = buffer.row(0);
    [row[0], row[1], row[2], row[3]]
}

#[test]
fn test_sepia_full_intensity() {
    let mut buffer = frame([10, 20, 30, 200]);
    FilterPreset::Sepia.apply_in_place(1.0, &mut buffer);
    assert_eq!(first_pixel(&buffer), [20, 26, 29, 200]);
}

#[test]
fn test_sepia_clamps_bright_pixels() {
    let mut buffer = frame([255, 255, 255, 255]);
    FilterPreset::Sepia.apply_in_place(1.0, &mut buffer);
    assert_eq!(first_pixel(&buffer), [239, 255, 255, 255]);
}

#[test]
fn test_mono_and_invert() {
    let mut mono = frame([10, 20, 30, 255]);
    FilterPreset::Mono.apply_in_place(1.0, &mut mono);
    assert_eq!(first_pixel(&mono), [22, 22, 22, 255]);

    let mut inverted = frame([10, 20, 30, 255]);
    FilterPreset::Invert.apply_in_place(0.5, &mut inverted);
    assert_eq!(first_pixel(&inverted), [128, 128, 128, 255]);
}

#[test]
fn test_zero_intensity_keeps_frame() {
    let mut buffer = frame([10, 20, 30, 255]);
    FilterPreset::Invert.apply_in_place(0.0, &mut buffer);
    assert_eq!(buffer, frame([10, 20, 30, 255]));
}

#[test]
fn test_apply_into_matches_in_place() {
    let input = frame([10, 20, 30, 255]);
    let mut output = PixelBuffer::new(2, 2, PixelFormat::Bgra32);
    FilterPreset::Sepia.apply_into(1.0, &input, &mut output);

    let mut expected = input.clone();
    FilterPreset::Sepia.apply_in_place(1.0, &mut expected);
    assert_eq!(output, expected);
    // source untouched
    assert_eq!(first_pixel(&input), [10, 20, 30, 255]);
}

#[test]
fn test_adjust_callback_forms() {
    let callback = FilterPreset::Mono.adjust_callback(1.0);
    assert!(callback.has_in_place());
    assert!(callback.has_into_output());

    let mut buffer = frame([10, 20, 30, 255]);
    assert!(callback.adjust_pixel_buffer(&mut buffer));
    assert_eq!(first_pixel(&buffer), [22, 22, 22, 255]);

    let none = FilterPreset::None.adjust_callback(1.0);
    assert!(!none.has_in_place());
    assert!(!none.has_into_output());
}

#[test]
fn test_parse_presets() {
    assert_eq!("sepia".parse::<FilterPreset>().unwrap(), FilterPreset::Sepia);
    assert_eq!(" Mono ".parse::<FilterPreset>().unwrap(), FilterPreset::Mono);

    let err = "vintage".parse::<FilterPreset>().unwrap_err().to_string();
    assert!(err.contains("vintage"), "{}", err);
    assert!(err.contains("sepia, mono, invert, none"), "{}", err);
}
