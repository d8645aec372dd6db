//! Runs a few descent steps on random triplets and checks the gradients
//! numerically.

use rand::{rngs::StdRng, Rng, SeedableRng};
use triplet_kernel::{
    nn::GradientChecker, GradientRequest, KernelResult, SampleBatch, SampleWeights, Shape, TripletLoss,
    TripletRole,
};

fn random_batch(rng: &mut StdRng, num: usize, channels: usize) -> KernelResult<SampleBatch> {
    let data = (0..num * channels).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    SampleBatch::from_vec(data, Shape::new([num, channels]))
}

fn main() -> KernelResult<()> {
    triplet_kernel::init()?;
    println!("Triplet kernel {}", triplet_kernel::version());

    let (num, channels) = (512, 2);
    let mut rng = StdRng::seed_from_u64(1701);
    let mut anchor = random_batch(&mut rng, num, channels)?;
    let mut positive = random_batch(&mut rng, num, channels)?;
    let mut negative = random_batch(&mut rng, num, channels)?;
    let weights = SampleWeights::new((0..num).map(|_| rng.gen_range(0.0f32..1.0)).collect())?;

    let mut layer = TripletLoss::with_margin(1.0)?;
    let learning_rate = 2.0;

    for step in 0..10 {
        let loss = layer.forward(&anchor, &positive, &negative, &weights)?;
        if let Some(summary) = layer.summary() {
            println!(
                "step {:2}: loss {:.6}, {:5.1}% of triplets violate the margin",
                step,
                loss,
                100.0 * summary.violating_fraction()
            );
        }

        // backward already points downhill, so the step adds it
        let grads = layer.gradients(learning_rate, GradientRequest::all())?;
        for (batch, role) in [
            (&mut anchor, TripletRole::Anchor),
            (&mut positive, TripletRole::Positive),
            (&mut negative, TripletRole::Negative),
        ] {
            for (x, g) in batch.as_slice_mut().iter_mut().zip(grads.get(role).as_slice()) {
                *x += g;
            }
        }
    }

    let batches = [anchor, positive, negative];
    let checker = GradientChecker::default();
    for role in TripletRole::ALL {
        let report = checker.check_sampled(&mut layer, &batches, &weights, role.index(), 64)?;
        println!(
            "{:>8} gradient: {} elements checked, {} kinks skipped, max error {:.2e}",
            role.name(),
            report.checked,
            report.skipped_kinks,
            report.max_abs_error
        );
    }
    Ok(())
}
